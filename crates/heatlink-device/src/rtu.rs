//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Modbus RTU master over a serial port."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use heatlink_common::config::{DeviceConfig, HoldingRead, WriteWindow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::trace;

use crate::transport::{FaultKind, Transport};

const FC_READ_COILS: u8 = 0x01;
const FC_READ_HOLDING: u8 = 0x03;
const FC_READ_INPUT: u8 = 0x04;
const FC_WRITE_SINGLE: u8 = 0x06;
const MAX_FRAME_LEN: usize = 256;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC16_TABLE: [u16; 256] = build_crc16_table();

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in data {
        let idx = ((crc ^ u16::from(*byte)) & 0x00FF) as usize;
        crc = (crc >> 8) ^ CRC16_TABLE[idx];
    }
    crc
}

pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn decode_frame(data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let payload = &data[..data.len() - 2];
    let got = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
    if crc16(payload) != got {
        return None;
    }
    Some((payload[0], &payload[1..]))
}

/// Find a complete frame ending at the tail of `buffer`, skipping leading noise.
fn decode_suffix_frame(buffer: &[u8]) -> Option<(u8, &[u8])> {
    if buffer.len() < 4 {
        return None;
    }
    (0..=buffer.len() - 4).find_map(|start| decode_frame(&buffer[start..]))
}

fn request_pdu(function: u8, address: u16, word: u16) -> [u8; 5] {
    let [address_hi, address_lo] = address.to_be_bytes();
    let [word_hi, word_lo] = word.to_be_bytes();
    [function, address_hi, address_lo, word_hi, word_lo]
}

fn check_exception(function: u8, pdu: &[u8]) -> Result<(), FaultKind> {
    match pdu.first() {
        Some(code) if *code == function => Ok(()),
        Some(code) if *code == function | 0x80 => Err(FaultKind::Exception {
            function,
            code: pdu.get(1).copied().unwrap_or(0),
        }),
        Some(code) => Err(FaultKind::Frame(format!(
            "unexpected function {code:#04x} in reply to {function:#04x}"
        ))),
        None => Err(FaultKind::Frame("empty reply".to_owned())),
    }
}

pub fn parse_register_reply(function: u8, pdu: &[u8], count: u16) -> Result<Vec<u16>, FaultKind> {
    check_exception(function, pdu)?;
    let byte_count = usize::from(*pdu.get(1).unwrap_or(&0));
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| FaultKind::Frame("truncated register reply".to_owned()))?;
    if byte_count != usize::from(count) * 2 {
        return Err(FaultKind::Frame(format!(
            "expected {} register bytes, got {byte_count}",
            usize::from(count) * 2
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn parse_coil_reply(pdu: &[u8], count: u16) -> Result<Vec<bool>, FaultKind> {
    check_exception(FC_READ_COILS, pdu)?;
    let byte_count = usize::from(*pdu.get(1).unwrap_or(&0));
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| FaultKind::Frame("truncated coil reply".to_owned()))?;
    if byte_count * 8 < usize::from(count) {
        return Err(FaultKind::Frame("coil reply shorter than requested".to_owned()));
    }
    Ok((0..usize::from(count))
        .map(|n| data[n / 8] & (1 << (n % 8)) != 0)
        .collect())
}

/// Returns the echoed register value.
pub fn parse_write_reply(pdu: &[u8], address: u16) -> Result<u16, FaultKind> {
    check_exception(FC_WRITE_SINGLE, pdu)?;
    if pdu.len() < 5 {
        return Err(FaultKind::Frame("truncated write echo".to_owned()));
    }
    let echoed_address = u16::from_be_bytes([pdu[1], pdu[2]]);
    if echoed_address != address {
        return Err(FaultKind::Frame(format!(
            "write echo for {echoed_address}, expected {address}"
        )));
    }
    Ok(u16::from_be_bytes([pdu[3], pdu[4]]))
}

/// Byte stream to the controller.
pub trait RtuLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop received bytes nobody has read yet, such as a reply that arrived
    /// after its request timed out.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

impl RtuLink for SerialStream {
    fn discard_input(&mut self) -> std::io::Result<()> {
        tokio_serial::SerialPort::clear(self, ClearBuffer::Input).map_err(std::io::Error::from)
    }
}

/// Modbus RTU master for the controller's serial port.
#[derive(Debug)]
pub struct RtuTransport<L = SerialStream> {
    stream: Mutex<L>,
    unit_id: u8,
    response_timeout: Duration,
    holding_read: HoldingRead,
    write_window: WriteWindow,
}

impl RtuTransport {
    pub fn open(config: &DeviceConfig) -> Result<Self, FaultKind> {
        let stream = tokio_serial::new(&config.serial_port, config.baud_rate)
            .parity(Parity::None)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|err| {
                FaultKind::Io(format!(
                    "failed to open serial port '{}': {err}",
                    config.serial_port
                ))
            })?;
        Ok(Self::with_link(stream, config))
    }
}

impl<L: RtuLink> RtuTransport<L> {
    pub fn with_link(link: L, config: &DeviceConfig) -> Self {
        Self {
            stream: Mutex::new(link),
            unit_id: config.unit_id,
            response_timeout: config.response_timeout_ms,
            holding_read: config.holding_read,
            write_window: config.write_window,
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, FaultKind> {
        let frame = encode_frame(self.unit_id, request);
        let mut stream = self.stream.lock().await;
        stream
            .discard_input()
            .map_err(|err| FaultKind::Io(err.to_string()))?;
        trace!(unit_id = self.unit_id, function = request[0], "sending rtu request");
        stream
            .write_all(&frame)
            .await
            .map_err(|err| FaultKind::Io(err.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|err| FaultKind::Io(err.to_string()))?;

        let deadline = Instant::now() + self.response_timeout;
        let mut buffer = Vec::with_capacity(MAX_FRAME_LEN);
        let mut byte = [0u8; 1];
        loop {
            if buffer.len() == MAX_FRAME_LEN {
                buffer.remove(0);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(FaultKind::Timeout);
            };
            let n = match timeout(remaining, stream.read(&mut byte)).await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(FaultKind::Io(err.to_string())),
                Err(_) => return Err(FaultKind::Timeout),
            };
            if n == 0 {
                return Err(FaultKind::Io("serial port closed".to_owned()));
            }
            buffer.push(byte[0]);

            if let Some((unit, pdu)) = decode_suffix_frame(&buffer) {
                if unit == self.unit_id {
                    trace!(unit_id = unit, pdu_len = pdu.len(), "received rtu reply");
                    return Ok(pdu.to_vec());
                }
                buffer.clear();
            }
        }
    }

    async fn echo_read(&self, address: u16) -> Result<u16, FaultKind> {
        let reply = self
            .exchange(&request_pdu(FC_WRITE_SINGLE, address, 0))
            .await?;
        parse_write_reply(&reply, address)
    }
}

#[async_trait]
impl<L: RtuLink + 'static> Transport for RtuTransport<L> {
    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, FaultKind> {
        let reply = self
            .exchange(&request_pdu(FC_READ_INPUT, address, count))
            .await?;
        parse_register_reply(FC_READ_INPUT, &reply, count)
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FaultKind> {
        match self.holding_read {
            HoldingRead::Fc03 => {
                let reply = self
                    .exchange(&request_pdu(FC_READ_HOLDING, address, count))
                    .await?;
                parse_register_reply(FC_READ_HOLDING, &reply, count)
            }
            HoldingRead::Echo => {
                let mut words = Vec::with_capacity(usize::from(count));
                for offset in 0..count {
                    words.push(self.echo_read(address.saturating_add(offset)).await?);
                }
                Ok(words)
            }
        }
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FaultKind> {
        let reply = self
            .exchange(&request_pdu(FC_READ_COILS, address, count))
            .await?;
        parse_coil_reply(&reply, count)
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), FaultKind> {
        let target = self.write_window.translate(address);
        let reply = self
            .exchange(&request_pdu(FC_WRITE_SINGLE, target, value))
            .await?;
        parse_write_reply(&reply, target).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Answers FC04 requests from a register table as soon as they are written.
    #[derive(Default)]
    struct BenchLink {
        unread: VecDeque<u8>,
        inputs: HashMap<u16, u16>,
    }

    impl AsyncRead for BenchLink {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            while buf.remaining() > 0 {
                match this.unread.pop_front() {
                    Some(byte) => buf.put_slice(&[byte]),
                    None => break,
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for BenchLink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            if let Some((unit, pdu)) = decode_frame(buf) {
                if pdu[0] == FC_READ_INPUT {
                    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                    let mut reply = vec![FC_READ_INPUT, (count * 2) as u8];
                    for offset in 0..count {
                        let word = this.inputs.get(&(address + offset)).copied().unwrap_or(0);
                        reply.extend_from_slice(&word.to_be_bytes());
                    }
                    this.unread.extend(encode_frame(unit, &reply));
                }
            }
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl RtuLink for BenchLink {
        fn discard_input(&mut self) -> std::io::Result<()> {
            self.unread.clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn late_reply_to_an_earlier_request_is_not_taken_as_the_answer() {
        let config = DeviceConfig {
            unit_id: 0x10,
            ..DeviceConfig::default()
        };
        let mut link = BenchLink::default();
        link.inputs.insert(1, 215);
        link.inputs.insert(2, 99);
        // Reply to a read of register 1 that came in after that read gave up.
        link.unread
            .extend(encode_frame(0x10, &[FC_READ_INPUT, 0x02, 0x00, 0xD7]));
        let transport = RtuTransport::with_link(link, &config);

        assert_eq!(transport.read_input_registers(2, 1).await, Ok(vec![99]));
        assert_eq!(transport.read_input_registers(1, 1).await, Ok(vec![215]));
    }

    #[test]
    fn crc16_known_vector() {
        let frame_wo_crc = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&frame_wo_crc), 0xCDC5);
    }

    #[test]
    fn frame_round_trip_and_bad_crc() {
        let frame = encode_frame(0x10, &[0x04, 0x00, 0x01, 0x00, 0x01]);
        let (unit, pdu) = decode_frame(&frame).unwrap();
        assert_eq!(unit, 0x10);
        assert_eq!(pdu, &[0x04, 0x00, 0x01, 0x00, 0x01]);

        let mut corrupted = frame.clone();
        corrupted[3] ^= 0xFF;
        assert!(decode_frame(&corrupted).is_none());
    }

    #[test]
    fn suffix_decoding_skips_leading_noise() {
        let frame = encode_frame(0x10, &[0x03, 0x02, 0x00, 0x2A]);
        let mut noisy = vec![0x55, 0xAA];
        noisy.extend_from_slice(&frame);
        let (unit, pdu) = decode_suffix_frame(&noisy).unwrap();
        assert_eq!(unit, 0x10);
        assert_eq!(pdu, &[0x03, 0x02, 0x00, 0x2A]);
        assert!(decode_suffix_frame(&frame[..frame.len() - 1]).is_none());
    }

    #[test]
    fn register_and_coil_replies_decode() {
        let words = parse_register_reply(FC_READ_INPUT, &[0x04, 0x04, 0x00, 0xD7, 0xFF, 0xCE], 2)
            .unwrap();
        assert_eq!(words, vec![215, 65_486]);

        let coils = parse_coil_reply(&[0x01, 0x02, 0b0000_0010, 0b0000_0001], 10).unwrap();
        assert!(!coils[0]);
        assert!(coils[1]);
        assert!(coils[8]);
        assert_eq!(coils.len(), 10);
    }

    #[test]
    fn exception_replies_surface_their_code() {
        let err = parse_register_reply(FC_READ_INPUT, &[0x84, 0x02], 1).unwrap_err();
        assert_eq!(
            err,
            FaultKind::Exception {
                function: FC_READ_INPUT,
                code: 0x02
            }
        );
    }

    #[test]
    fn write_echo_must_name_the_target_register() {
        assert_eq!(
            parse_write_reply(&[0x06, 0x01, 0x05, 0x00, 0x2A], 261),
            Ok(42)
        );
        assert!(parse_write_reply(&[0x06, 0x00, 0x05, 0x00, 0x2A], 261).is_err());
    }
}
