//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Closed vocabulary of job kinds serviced by the dispatcher."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Every unit of work the dispatcher knows how to service.
///
/// The wire names (`getSensorData`, `setIP`, ...) are what configuration
/// files and backend commands use; anything else is rejected while parsing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum JobKind {
    GetSensorData,
    GetRelayData,
    GetUserData,
    GetMonteurData,
    GetSystemStatusData,
    GetSystemTimeData,
    GetSpecialBlocksData,
    GetSystemBlocksData,
    GetNetStatus,
    #[serde(rename = "setIP")]
    #[strum(serialize = "setIP")]
    SetIp,
    SetNetOn,
    SetNetOff,
    SetSettingData,
    GetPing,
}

impl JobKind {
    /// Jobs whose handler reads a configured register group.
    pub fn reads_register_group(self) -> bool {
        matches!(
            self,
            JobKind::GetSensorData
                | JobKind::GetRelayData
                | JobKind::GetUserData
                | JobKind::GetMonteurData
                | JobKind::GetSystemStatusData
                | JobKind::GetSystemTimeData
                | JobKind::GetSpecialBlocksData
                | JobKind::GetSystemBlocksData
        )
    }

    /// Jobs that carry a payload and therefore cannot be raised by a timer.
    pub fn requires_payload(self) -> bool {
        matches!(self, JobKind::SetIp | JobKind::SetSettingData)
    }

    /// Jobs that only make sense when raised by another component.
    pub fn is_command(self) -> bool {
        matches!(
            self,
            JobKind::SetIp | JobKind::SetNetOn | JobKind::SetNetOff | JobKind::SetSettingData
        )
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}
