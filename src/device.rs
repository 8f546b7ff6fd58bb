// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! ZTEX 1.15x device model: firmware descriptor, capability set and the
//! vendor command map of the mining firmware.

use crate::error::{self, ErrorKind};
use crate::misc::LOGGER;
use crate::usb::{Transport, ZTEX_PRODUCT_ID, ZTEX_VENDOR_ID};

use byteorder::{ByteOrder, LittleEndian};
use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use slog::{info, trace, warn};

use std::fmt;
use std::str;

/// Read ZTEX descriptor 1 (the firmware self description)
pub const REQ_READ_FW_DESCRIPTOR: u8 = 0x22;
/// Read the FPGA configuration state block
pub const REQ_GET_FPGA_STATE: u8 = 0x30;
/// Reset the FPGA and drop its configuration
pub const CMD_RESET_FPGA: u8 = 0x31;
/// Send one chunk of bitstream data through endpoint 0
pub const CMD_SEND_FPGA_DATA: u8 = 0x32;
/// Read the high speed configuration settings (endpoint and interface)
pub const REQ_GET_HS_SETTINGS: u8 = 0x33;
/// Start a high speed FPGA configuration
pub const CMD_INIT_HS_CONFIG: u8 = 0x34;
/// Finish a high speed FPGA configuration
pub const CMD_FINISH_HS_CONFIG: u8 = 0x35;
/// Upload one hash job (12 byte data tail + 32 byte midstate)
pub const CMD_SEND_HASH_DATA: u8 = 0x80;
/// Read the result register block (numNonces slots of 12 bytes)
pub const REQ_READ_HASH_DATA: u8 = 0x81;
/// Read the mining firmware descriptor
pub const REQ_READ_MINER_DESCRIPTOR: u8 = 0x82;
/// Set the FPGA clock multiplier M
pub const CMD_SET_FREQ: u8 = 0x83;

/// Size of one result register slot (golden nonce, running nonce, hash word 7)
pub const NONCE_SLOT_BYTES: usize = 12;

const FW_DESCRIPTOR_BYTES: usize = 40;
const MINER_DESCRIPTOR_BYTES: usize = 64;
const FPGA_STATE_BYTES: usize = 9;

/// Firmware capabilities announced in ZTEX descriptor 1
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    Eeprom = 0,
    Fpga = 1,
    Flash = 2,
    Debug = 3,
    Xmega = 4,
    HsFpga = 5,
    MacEeprom = 6,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::Eeprom => "EEPROM read/write",
            Capability::Fpga => "FPGA configuration",
            Capability::Flash => "Flash memory support",
            Capability::Debug => "Debug helper",
            Capability::Xmega => "XMEGA support",
            Capability::HsFpga => "High speed FPGA configuration",
            Capability::MacEeprom => "MAC EEPROM read/write",
        }
    }
}

/// ZTEX descriptor 1, the fixed 40 byte block every supported firmware
/// announces itself with
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(endian = "lsb")]
pub struct FirmwareDescriptor {
    size: u8,
    version: u8,
    magic: [u8; 4],
    pub product_id: [u8; 4],
    pub fw_version: u8,
    pub interface_version: u8,
    capabilities: [u8; 6],
    module_reserved: [u8; 12],
    serial_reserved: [u8; 10],
}

impl FirmwareDescriptor {
    fn validate(&self) -> error::Result<()> {
        if self.size as usize != FW_DESCRIPTOR_BYTES || self.version != 1 || &self.magic != b"ZTEX"
        {
            Err(ErrorKind::InvalidFirmware(format!(
                "bad descriptor header (size {}, version {})",
                self.size, self.version
            )))?
        }
        // product family 10.x.1.1 is the mining firmware
        if !(self.product_id[0] == 10 && self.product_id[2] == 1 && self.product_id[3] == 1) {
            Err(ErrorKind::InvalidFirmware(format!(
                "wrong or no mining firmware (product ID {}.{}.{}.{})",
                self.product_id[0], self.product_id[1], self.product_id[2], self.product_id[3]
            )))?
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        let index = capability as usize;
        self.capabilities[index / 8] & (1 << (index % 8)) != 0
    }
}

/// FPGA configuration state as reported by the firmware
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(endian = "lsb")]
pub struct FpgaState {
    unconfigured: u8,
    /// 8-bit sum of all configuration bytes the firmware forwarded
    pub checksum: u8,
    /// Number of configuration bytes the firmware forwarded
    pub transferred_bytes: u32,
    /// INIT_B pin history, useful when a configuration attempt fails
    pub init_b: u8,
    pub flash_result: u8,
    pub flash_bit_swap: u8,
}

impl FpgaState {
    /// Whether the DONE pin went high (the FPGA accepted its configuration)
    pub fn configured(&self) -> bool {
        self.unconfigured == 0
    }
}

/// One result register slot
#[derive(PackedStruct, Debug, Clone, Copy, Default)]
#[packed_struct(endian = "lsb")]
pub struct NonceSlot {
    /// Last nonce the hardware considered a solution
    pub golden_nonce: u32,
    /// Running nonce counter of the hashing core
    pub nonce: u32,
    /// Word 7 of the hash of the running nonce (without the final IV add)
    pub hash7: u32,
}

/// Mining firmware descriptor read once at attach time and immutable
/// afterwards, short of a forced re-read
#[derive(Debug, Clone)]
pub struct MinerDescriptor {
    pub version: u8,
    /// Number of result slots per poll
    pub num_nonces: usize,
    /// Bias the hardware adds to every reported nonce
    pub offs_nonces: i32,
    /// Clock step in MHz, the actual frequency is `step * (M + 1)`
    pub freq_step_mhz: f64,
    /// Default clock multiplier
    pub freq_m: u8,
    /// Maximal supported clock multiplier
    pub freq_max_m: u8,
    pub hashes_per_clock: f64,
    /// Base name of the bitstream image this board wants
    pub bitfile_name: String,
}

impl MinerDescriptor {
    fn parse(buf: &[u8]) -> error::Result<Self> {
        if buf.len() < MINER_DESCRIPTOR_BYTES {
            Err(ErrorKind::InvalidFirmware(format!(
                "short miner descriptor: {} bytes",
                buf.len()
            )))?
        }

        let version = buf[0];
        let num_nonces = buf[1] as usize + 1;
        let offs_nonces = LittleEndian::read_u16(&buf[2..4]) as i32 - 10000;
        let freq_step_mhz = LittleEndian::read_u16(&buf[4..6]) as f64 * 0.01;
        let mut freq_m = buf[6];
        let freq_max_m = buf[7];
        if freq_m > freq_max_m {
            freq_m = freq_max_m;
        }

        let (name_offset, mut hashes_per_clock) = if version == 4 {
            let raw = LittleEndian::read_u16(&buf[8..10]);
            (10, (raw as f64 + 1.0) / 128.0)
        } else {
            (8, 1.0)
        };

        let name_end = buf[name_offset..]
            .iter()
            .position(|&b| b == 0)
            .map(|pos| name_offset + pos)
            .unwrap_or(buf.len());
        if name_end <= name_offset {
            Err(ErrorKind::InvalidFirmware(
                "missing bitstream file name".to_string(),
            ))?
        }
        let bitfile_name = str::from_utf8(&buf[name_offset..name_end])
            .map_err(|_| {
                ErrorKind::InvalidFirmware("bitstream file name is not valid UTF-8".to_string())
            })?
            .to_string();

        if version != 4 {
            if bitfile_name.starts_with("ztex_ufm1_15b") {
                hashes_per_clock = 0.5;
            }
            warn!(
                LOGGER,
                "HASHES_PER_CLOCK not defined, assuming {:.2}", hashes_per_clock
            );
        }

        Ok(Self {
            version,
            num_nonces,
            offs_nonces,
            freq_step_mhz,
            freq_m,
            freq_max_m,
            hashes_per_clock,
            bitfile_name,
        })
    }

    /// Frequency in MHz produced by clock multiplier `m`
    pub fn frequency_mhz(&self, m: u8) -> f64 {
        self.freq_step_mhz * (m as f64 + 1.0)
    }
}

impl fmt::Display for MinerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "bitfile={}  f_default={:.2}MHz  f_max={:.2}MHz  HpC={:.1}H",
            self.bitfile_name,
            self.frequency_mhz(self.freq_m),
            self.frequency_mhz(self.freq_max_m),
            self.hashes_per_clock
        )
    }
}

/// One attached ZTEX board, identified and described. Owns the transport;
/// all higher level operations are expressed through the vendor command map.
pub struct ZtexDevice {
    transport: Box<dyn Transport>,
    serial: String,
    fw: FirmwareDescriptor,
    descriptor: MinerDescriptor,
    claimed: [bool; 256],
}

impl ZtexDevice {
    pub fn new(transport: Box<dyn Transport>) -> error::Result<Self> {
        let (vendor_id, product_id) = transport.ids();
        if vendor_id != ZTEX_VENDOR_ID || product_id != ZTEX_PRODUCT_ID {
            Err(ErrorKind::DeviceNotSupported(format!(
                "{:04x}:{:04x}",
                vendor_id, product_id
            )))?
        }
        let serial = transport.serial().ok_or_else(|| {
            error::Error::from(ErrorKind::InvalidFirmware(
                "missing serial number string".to_string(),
            ))
        })?;

        let fw = Self::read_fw_descriptor(&*transport)?;
        let descriptor = Self::read_miner_descriptor(&*transport)?;
        info!(LOGGER, "{}: {}", serial, descriptor);

        Ok(Self {
            transport,
            serial,
            fw,
            descriptor,
            claimed: [false; 256],
        })
    }

    fn read_fw_descriptor(transport: &dyn Transport) -> error::Result<FirmwareDescriptor> {
        let buf = transport.vendor_request(REQ_READ_FW_DESCRIPTOR, 0, 0, FW_DESCRIPTOR_BYTES)?;
        if buf.len() != FW_DESCRIPTOR_BYTES {
            Err(ErrorKind::InvalidFirmware(format!(
                "descriptor read returned {} bytes",
                buf.len()
            )))?
        }
        let fw = FirmwareDescriptor::unpack_from_slice(&buf).map_err(|_| {
            ErrorKind::InvalidFirmware("cannot decode firmware descriptor".to_string())
        })?;
        fw.validate()?;
        Ok(fw)
    }

    fn read_miner_descriptor(transport: &dyn Transport) -> error::Result<MinerDescriptor> {
        let buf =
            transport.vendor_request(REQ_READ_MINER_DESCRIPTOR, 0, 0, MINER_DESCRIPTOR_BYTES)?;
        MinerDescriptor::parse(&buf)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn descriptor(&self) -> &MinerDescriptor {
        &self.descriptor
    }

    /// Drop the cached miner descriptor and read it again from the firmware
    pub fn reload_descriptor(&mut self) -> error::Result<()> {
        self.descriptor = Self::read_miner_descriptor(&*self.transport)?;
        Ok(())
    }

    /// Verify a required capability up front. This is a contract, not advice:
    /// every capability gated operation calls it before touching the wire.
    pub fn check_capability(&self, capability: Capability) -> error::Result<()> {
        if !self.fw.has_capability(capability) {
            Err(ErrorKind::Capability(capability.name().to_string()))?
        }
        Ok(())
    }

    pub fn fpga_state(&self) -> error::Result<FpgaState> {
        self.check_capability(Capability::Fpga)?;
        let buf = self
            .transport
            .vendor_request(REQ_GET_FPGA_STATE, 0, 0, FPGA_STATE_BYTES)?;
        if buf.len() != FPGA_STATE_BYTES {
            Err(ErrorKind::Usb(format!(
                "FPGA state read returned {} bytes",
                buf.len()
            )))?
        }
        let state = FpgaState::unpack_from_slice(&buf)
            .map_err(|_| ErrorKind::Usb("cannot decode FPGA state".to_string()))?;
        Ok(state)
    }

    pub fn fpga_configured(&self) -> error::Result<bool> {
        Ok(self.fpga_state()?.configured())
    }

    pub fn reset_fpga(&self) -> error::Result<()> {
        self.check_capability(Capability::Fpga)?;
        self.transport.vendor_command(CMD_RESET_FPGA, 0, 0, &[])?;
        Ok(())
    }

    /// Set the FPGA clock multiplier, clamped to the descriptor maximum
    pub fn set_freq(&self, m: u8) -> error::Result<()> {
        let m = m.min(self.descriptor.freq_max_m);
        trace!(
            LOGGER,
            "{}: setting clock multiplier {} ({:.2} MHz)",
            self.serial,
            m,
            self.descriptor.frequency_mhz(m)
        );
        self.transport.vendor_command(CMD_SET_FREQ, m as u16, 0, &[])?;
        Ok(())
    }

    /// Upload one job payload; the hardware restarts its nonce counter
    pub fn send_hash_data(&self, payload: &[u8]) -> error::Result<()> {
        self.transport
            .vendor_command(CMD_SEND_HASH_DATA, 0, 0, payload)?;
        Ok(())
    }

    /// Read all result register slots
    pub fn read_hash_data(&self) -> error::Result<Vec<NonceSlot>> {
        let expected = self.descriptor.num_nonces * NONCE_SLOT_BYTES;
        let buf = self
            .transport
            .vendor_request(REQ_READ_HASH_DATA, 0, 0, expected)?;
        if buf.len() != expected {
            Err(ErrorKind::Usb(format!(
                "result read returned {} of {} bytes",
                buf.len(),
                expected
            )))?
        }
        let mut slots = Vec::with_capacity(self.descriptor.num_nonces);
        for chunk in buf.chunks(NONCE_SLOT_BYTES) {
            let slot = NonceSlot::unpack_from_slice(chunk)
                .map_err(|_| ErrorKind::Usb("cannot decode result slot".to_string()))?;
            slots.push(slot);
        }
        Ok(slots)
    }

    pub(crate) fn send_fpga_data(&self, chunk: &[u8]) -> error::Result<usize> {
        self.transport.vendor_command(CMD_SEND_FPGA_DATA, 0, 0, chunk)
    }

    pub(crate) fn init_hs_config(&self) -> error::Result<()> {
        self.transport.vendor_command(CMD_INIT_HS_CONFIG, 0, 0, &[])?;
        Ok(())
    }

    pub(crate) fn finish_hs_config(&self) -> error::Result<()> {
        self.transport
            .vendor_command(CMD_FINISH_HS_CONFIG, 0, 0, &[])?;
        Ok(())
    }

    /// Endpoint and interface the high speed configuration path uses
    pub(crate) fn hs_config_settings(&self) -> error::Result<(u8, u8)> {
        let buf = self.transport.vendor_request(REQ_GET_HS_SETTINGS, 0, 0, 2)?;
        if buf.len() < 2 {
            Err(ErrorKind::Usb(format!(
                "HS settings read returned {} bytes",
                buf.len()
            )))?
        }
        Ok((buf[0], buf[1]))
    }

    pub(crate) fn bulk_write(&self, endpoint: u8, data: &[u8]) -> error::Result<usize> {
        self.transport.bulk_write(endpoint, data)
    }

    pub(crate) fn interface_claimed(&self, iface: u8) -> bool {
        self.claimed[iface as usize]
    }

    pub(crate) fn claim_interface(&mut self, iface: u8) -> error::Result<()> {
        self.transport.claim_interface(iface)?;
        self.claimed[iface as usize] = true;
        Ok(())
    }

    pub(crate) fn release_interface(&mut self, iface: u8) -> error::Result<()> {
        self.transport.release_interface(iface)?;
        self.claimed[iface as usize] = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::usb::test::{nonce_slot, MockTransport};

    fn mock_device() -> (ZtexDevice, std::sync::Arc<std::sync::Mutex<crate::usb::test::MockState>>)
    {
        let (transport, state) = MockTransport::new();
        let device = ZtexDevice::new(Box::new(transport)).expect("cannot build mock device");
        (device, state)
    }

    #[test]
    fn test_attach_valid_device() {
        let (device, _state) = mock_device();
        assert_eq!(device.serial(), "TEST01");
        let descriptor = device.descriptor();
        assert_eq!(descriptor.num_nonces, 1);
        assert_eq!(descriptor.offs_nonces, 0);
        assert_eq!(descriptor.freq_m, 180);
        assert_eq!(descriptor.freq_max_m, 220);
        assert_eq!(descriptor.bitfile_name, "ztex_ufm1_15d4");
        assert!((descriptor.hashes_per_clock - 1.0).abs() < 1e-9);
        assert!((descriptor.frequency_mhz(descriptor.freq_m) - 724.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_usb_ids_are_rejected() {
        let (transport, state) = MockTransport::new();
        state.lock().unwrap().ids = (0x04b4, 0x8613);
        match ZtexDevice::new(Box::new(transport)) {
            Err(e) => match e.kind() {
                ErrorKind::DeviceNotSupported(_) => (),
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("cypress blank device must be rejected"),
        }
    }

    #[test]
    fn test_bad_descriptor_magic_is_invalid_firmware() {
        let (transport, state) = MockTransport::new();
        state.lock().unwrap().fw_descriptor[2..6].copy_from_slice(b"NOPE");
        match ZtexDevice::new(Box::new(transport)) {
            Err(e) => match e.kind() {
                ErrorKind::InvalidFirmware(_) => (),
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("bad magic must be rejected"),
        }
    }

    #[test]
    fn test_short_descriptor_is_invalid_firmware() {
        let (transport, state) = MockTransport::new();
        state.lock().unwrap().fw_descriptor.truncate(20);
        assert!(ZtexDevice::new(Box::new(transport)).is_err());
    }

    #[test]
    fn test_missing_capability_is_reported_by_name() {
        let (transport, state) = MockTransport::new();
        // announce no capabilities at all
        state.lock().unwrap().fw_descriptor[12..18].copy_from_slice(&[0; 6]);
        let device = ZtexDevice::new(Box::new(transport)).expect("attach failed");
        match device.check_capability(Capability::HsFpga) {
            Err(e) => match e.kind() {
                ErrorKind::Capability(name) => {
                    assert_eq!(name, "High speed FPGA configuration")
                }
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(()) => panic!("capability check must fail"),
        }
    }

    #[test]
    fn test_descriptor_clamps_default_frequency() {
        let (transport, state) = MockTransport::new();
        {
            let mut state = state.lock().unwrap();
            state.miner_descriptor[6] = 250; // default above the maximum of 220
        }
        let device = ZtexDevice::new(Box::new(transport)).expect("attach failed");
        assert_eq!(device.descriptor().freq_m, 220);
    }

    #[test]
    fn test_legacy_descriptor_hashes_per_clock() {
        let (transport, state) = MockTransport::new();
        {
            let mut state = state.lock().unwrap();
            let mut buf = vec![2u8, 0];
            buf.extend_from_slice(&10000u16.to_le_bytes());
            buf.extend_from_slice(&400u16.to_le_bytes());
            buf.push(180);
            buf.push(220);
            buf.extend_from_slice(b"ztex_ufm1_15b1\0");
            buf.resize(64, 0);
            state.miner_descriptor = buf;
        }
        let device = ZtexDevice::new(Box::new(transport)).expect("attach failed");
        let descriptor = device.descriptor();
        assert_eq!(descriptor.bitfile_name, "ztex_ufm1_15b1");
        assert!((descriptor.hashes_per_clock - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_read_hash_data_decodes_slots() {
        let (device, state) = mock_device();
        {
            let mut state = state.lock().unwrap();
            state.sent_jobs.push(vec![0; 44]);
            state.nonce_after_job = nonce_slot(0xdeadbeef, 0x01020304, 0x0a0b0c0d);
        }
        let slots = device.read_hash_data().expect("result read failed");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].golden_nonce, 0xdeadbeef);
        assert_eq!(slots[0].nonce, 0x01020304);
        assert_eq!(slots[0].hash7, 0x0a0b0c0d);
    }

    #[test]
    fn test_set_freq_is_clamped() {
        let (device, state) = mock_device();
        device.set_freq(255).expect("set_freq failed");
        assert_eq!(state.lock().unwrap().freq_history, vec![220]);
    }
}
