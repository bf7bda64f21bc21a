//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reads and decodes a configured register group."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use heatlink_common::config::{Encoding, PollGroup, RegisterEntry, RegisterKind, Scale};
use serde_json::{Map, Value};
use tracing::debug;

use crate::codec::{compose_u32, decimal_multiplier, expand_bits, fold_signed, scale_value};
use crate::transport::{FaultKind, Transport};

/// Outcome of one pass over a register group.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupRead {
    /// Fields destined for the group's section.
    pub fields: Map<String, Value>,
    /// Fields marked `top_level`.
    pub top_level: Map<String, Value>,
    /// Fields that could not be read, with the reason.
    pub failures: Vec<(String, FaultKind)>,
    /// Set when a link fault stopped the pass early.
    pub aborted: bool,
}

impl GroupRead {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.top_level.is_empty()
    }
}

/// Read every entry of `group`. A failing field is skipped; a link fault ends the pass.
pub async fn read_group<T: Transport + ?Sized>(transport: &T, group: &PollGroup) -> GroupRead {
    let mut read = GroupRead::default();
    let mut selectors: HashMap<u16, Option<f64>> = HashMap::new();
    let coils = read_coil_block(transport, &group.fields).await;

    for entry in &group.fields {
        let decoded = match entry.kind {
            RegisterKind::Coil => coil_value(&coils, entry),
            _ => decode_entry(transport, entry, &mut selectors).await,
        };
        match decoded {
            Ok(values) => {
                let target = if entry.top_level {
                    &mut read.top_level
                } else {
                    &mut read.fields
                };
                target.extend(values);
            }
            Err(fault) => {
                debug!(job = %group.job, field = %entry.name, error = %fault, "register read failed");
                let link_down = fault.is_link_fault();
                read.failures.push((entry.name.clone(), fault));
                if link_down {
                    read.aborted = true;
                    break;
                }
            }
        }
    }
    read
}

type CoilBlock = Option<Result<(u16, Vec<bool>), FaultKind>>;

/// Most coils one FC01 request may cover.
const MAX_COIL_SPAN: u32 = 2000;

async fn read_coil_block<T: Transport + ?Sized>(
    transport: &T,
    entries: &[RegisterEntry],
) -> CoilBlock {
    let addresses = entries
        .iter()
        .filter(|entry| entry.kind == RegisterKind::Coil)
        .map(|entry| entry.address);
    let (Some(first), Some(last)) = (addresses.clone().min(), addresses.max()) else {
        return None;
    };
    let span = u32::from(last - first) + 1;
    let Some(count) = u16::try_from(span).ok().filter(|_| span <= MAX_COIL_SPAN) else {
        return Some(Err(FaultKind::Decode(format!(
            "coils {first}..={last} span more than {MAX_COIL_SPAN}"
        ))));
    };
    Some(
        transport
            .read_coils(first, count)
            .await
            .map(|bits| (first, bits)),
    )
}

fn coil_value(coils: &CoilBlock, entry: &RegisterEntry) -> Result<Vec<(String, Value)>, FaultKind> {
    match coils {
        Some(Ok((first, bits))) => {
            let index = usize::from(entry.address - first);
            let bit = bits
                .get(index)
                .copied()
                .ok_or_else(|| FaultKind::Frame(format!("coil {} missing", entry.address)))?;
            Ok(vec![(entry.name.clone(), Value::from(u8::from(bit)))])
        }
        Some(Err(fault)) => Err(fault.clone()),
        None => Err(FaultKind::Decode(format!(
            "coil {} outside the coil block",
            entry.address
        ))),
    }
}

async fn decode_entry<T: Transport + ?Sized>(
    transport: &T,
    entry: &RegisterEntry,
    selectors: &mut HashMap<u16, Option<f64>>,
) -> Result<Vec<(String, Value)>, FaultKind> {
    let raw: i64 = match entry.encoding {
        Encoding::Bits => {
            let word = transport.read_word(entry.kind, entry.address).await?;
            let fields = expand_bits(word, entry.bit_count)
                .enumerate()
                .map(|(n, bit)| {
                    let index = entry.first_index + n as u32;
                    (format!("{}{}", entry.name, index), Value::from(bit))
                })
                .collect();
            return Ok(fields);
        }
        Encoding::U16 => i64::from(transport.read_word(entry.kind, entry.address).await?),
        Encoding::S16 => i64::from(fold_signed(
            transport.read_word(entry.kind, entry.address).await?,
        )),
        Encoding::U32 => {
            let high = transport.read_word(entry.kind, entry.address).await?;
            let low = transport
                .read_word(entry.kind, entry.low_word_address())
                .await?;
            i64::from(compose_u32(high, low))
        }
    };

    let selector = match entry.scale {
        Some(Scale::DecimalSelector(register)) => {
            resolve_selector(transport, entry.kind, register, selectors).await?
        }
        _ => None,
    };
    let value = scale_value(raw + entry.read_offset, entry.scale, selector);
    Ok(vec![(entry.name.clone(), value)])
}

/// Selector registers are read at most once per pass.
async fn resolve_selector<T: Transport + ?Sized>(
    transport: &T,
    kind: RegisterKind,
    register: u16,
    selectors: &mut HashMap<u16, Option<f64>>,
) -> Result<Option<f64>, FaultKind> {
    if let Some(cached) = selectors.get(&register) {
        return Ok(*cached);
    }
    let raw = transport.read_word(kind, register).await?;
    let multiplier = decimal_multiplier(raw);
    if multiplier.is_none() {
        debug!(register, raw, "decimal selector out of range; leaving value unscaled");
    }
    selectors.insert(register, multiplier);
    Ok(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTransport;
    use heatlink_common::JobKind;
    use serde_json::json;

    fn entry(name: &str, address: u16, kind: RegisterKind, encoding: Encoding) -> RegisterEntry {
        RegisterEntry {
            name: name.to_owned(),
            address,
            kind,
            encoding,
            low_address: None,
            scale: None,
            read_offset: 0,
            top_level: false,
            first_index: 1,
            bit_count: 16,
        }
    }

    fn group(fields: Vec<RegisterEntry>) -> PollGroup {
        PollGroup {
            job: JobKind::GetSensorData,
            section: Some("sensordata".to_owned()),
            fields,
        }
    }

    #[tokio::test]
    async fn decodes_signed_composite_and_scaled_fields() {
        let device = SimulatedTransport::new();
        device.set_input(1, 65_486).await;
        device.set_input(2, 215).await;
        device.set_input(325, 1).await;
        device.set_input(326, 6).await;
        device.set_input(29, 4).await;

        let mut energy = entry("S_5_M", 325, RegisterKind::Input, Encoding::U32);
        energy.scale = Some(Scale::DecimalSelector(29));
        let read = read_group(
            &device,
            &group(vec![
                entry("F1", 1, RegisterKind::Input, Encoding::S16),
                entry("F2", 2, RegisterKind::Input, Encoding::S16),
                energy,
            ]),
        )
        .await;

        assert!(read.failures.is_empty());
        assert_eq!(read.fields["F1"], json!(-50));
        assert_eq!(read.fields["F2"], json!(215));
        assert_eq!(read.fields["S_5_M"], json!(6554.2));
    }

    #[tokio::test]
    async fn coil_span_beyond_one_request_fails_only_the_coils() {
        let device = SimulatedTransport::new();
        device.set_input(1, 215).await;

        let read = read_group(
            &device,
            &group(vec![
                entry("LOW", 0, RegisterKind::Coil, Encoding::U16),
                entry("HIGH", u16::MAX, RegisterKind::Coil, Encoding::U16),
                entry("F1", 1, RegisterKind::Input, Encoding::S16),
            ]),
        )
        .await;

        assert!(!read.aborted);
        assert_eq!(read.failures.len(), 2);
        assert!(matches!(read.failures[0].1, FaultKind::Decode(_)));
        assert_eq!(read.fields["F1"], json!(215));
    }

    #[tokio::test]
    async fn coils_bits_offsets_and_top_level_fields() {
        let device = SimulatedTransport::new();
        device.set_coil(9, true).await;
        device.set_holding(171, 0b101).await;
        device.set_holding(5, 10).await;
        device.set_holding(209, 3).await;

        let mut blocks = entry("SBLOCK", 171, RegisterKind::Holding, Encoding::Bits);
        blocks.bit_count = 4;
        let mut b5 = entry("B5", 5, RegisterKind::Holding, Encoding::U16);
        b5.read_offset = 50;
        let mut cascade = entry("KASKADEonLIST", 209, RegisterKind::Holding, Encoding::U16);
        cascade.top_level = true;

        let read = read_group(
            &device,
            &group(vec![
                entry("RLY1", 8, RegisterKind::Coil, Encoding::U16),
                entry("RLY2", 9, RegisterKind::Coil, Encoding::U16),
                blocks,
                b5,
                cascade,
            ]),
        )
        .await;

        assert_eq!(read.fields["RLY1"], json!(0));
        assert_eq!(read.fields["RLY2"], json!(1));
        assert_eq!(read.fields["SBLOCK1"], json!(1));
        assert_eq!(read.fields["SBLOCK2"], json!(0));
        assert_eq!(read.fields["SBLOCK3"], json!(1));
        assert!(!read.fields.contains_key("SBLOCK5"));
        assert_eq!(read.fields["B5"], json!(60));
        assert_eq!(read.top_level["KASKADEonLIST"], json!(3));
    }

    #[tokio::test]
    async fn device_exception_skips_only_that_field() {
        let device = SimulatedTransport::new();
        device.set_input(1, 10).await;
        device.set_input(3, 30).await;
        device
            .break_address(2, FaultKind::Exception { function: 4, code: 2 })
            .await;

        let read = read_group(
            &device,
            &group(vec![
                entry("F1", 1, RegisterKind::Input, Encoding::U16),
                entry("F2", 2, RegisterKind::Input, Encoding::U16),
                entry("F3", 3, RegisterKind::Input, Encoding::U16),
            ]),
        )
        .await;

        assert!(!read.aborted);
        assert_eq!(read.fields.len(), 2);
        assert!(!read.fields.contains_key("F2"));
        assert_eq!(read.failures[0].0, "F2");
    }

    #[tokio::test]
    async fn link_fault_aborts_the_pass() {
        let device = SimulatedTransport::new();
        device.set_input(1, 10).await;
        device.break_address(2, FaultKind::Timeout).await;

        let read = read_group(
            &device,
            &group(vec![
                entry("F1", 1, RegisterKind::Input, Encoding::U16),
                entry("F2", 2, RegisterKind::Input, Encoding::U16),
                entry("F3", 3, RegisterKind::Input, Encoding::U16),
            ]),
        )
        .await;

        assert!(read.aborted);
        assert_eq!(read.fields.len(), 1);
        assert_eq!(read.failures.len(), 1);
    }
}
