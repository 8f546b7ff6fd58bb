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

//! Vendor class USB transport for ZTEX 1.15x boards.
//!
//! Everything above this module talks to the hardware exclusively through the
//! [`Transport`] trait, so the device logic never depends on libusb directly
//! and can run against scripted transports in tests.

use crate::config;
use crate::error::{self, ErrorKind};
use crate::misc::LOGGER;

use failure::ResultExt;

use lazy_static::lazy_static;
use slog::{info, warn};

use std::time::Duration;

/// ZTEX vendor ID
pub const ZTEX_VENDOR_ID: u16 = 0x221a;
/// Shared product ID of ZTEX devices that support descriptor 1
pub const ZTEX_PRODUCT_ID: u16 = 0x0100;

/// bmRequestType of a vendor write targeting the device
const VENDOR_TYPE_OUT: u8 = 0x40;
/// bmRequestType of a vendor read targeting the device
const VENDOR_TYPE_IN: u8 = 0xc0;

/// Primitive vendor class operations of one attached board. All transfers use
/// bounded timeouts and report failures as [`ErrorKind::Usb`], never silently.
pub trait Transport: Send {
    /// Issue a vendor control write (optionally carrying a payload), returning
    /// the number of payload bytes the device accepted
    fn vendor_command(&self, request: u8, value: u16, index: u16, data: &[u8])
        -> error::Result<usize>;

    /// Issue a vendor control read of up to `len` bytes
    fn vendor_request(&self, request: u8, value: u16, index: u16, len: usize)
        -> error::Result<Vec<u8>>;

    /// Stream data to a bulk endpoint, returning the number of bytes written
    fn bulk_write(&self, endpoint: u8, data: &[u8]) -> error::Result<usize>;

    fn claim_interface(&mut self, iface: u8) -> error::Result<()>;

    fn release_interface(&mut self, iface: u8) -> error::Result<()>;

    /// USB vendor/product ID pair of the underlying device
    fn ids(&self) -> (u16, u16);

    /// Serial number string, if the firmware provides one
    fn serial(&self) -> Option<String>;
}

lazy_static! {
    /// Process wide libusb context; device handles borrow it for 'static
    static ref USB_CONTEXT: libusb::Context =
        libusb::Context::new().expect("BUG: cannot create USB context");
}

/// [`Transport`] implementation backed by a libusb device handle
pub struct UsbTransport {
    handle: libusb::DeviceHandle<'static>,
    vendor_id: u16,
    product_id: u16,
    serial: Option<String>,
}

// The libusb library is thread safe and a device handle may be used from any
// thread as long as it is not used concurrently. The handle is moved between
// threads, never shared.
unsafe impl Send for UsbTransport {}

impl Transport for UsbTransport {
    fn vendor_command(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> error::Result<usize> {
        let sent = self
            .handle
            .write_control(
                VENDOR_TYPE_OUT,
                request,
                value,
                index,
                data,
                config::CONTROL_TIMEOUT,
            )
            .with_context(|_| ErrorKind::Usb(format!("control write {:#04x} failed", request)))?;
        Ok(sent)
    }

    fn vendor_request(
        &self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> error::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = self
            .handle
            .read_control(
                VENDOR_TYPE_IN,
                request,
                value,
                index,
                &mut buf,
                config::CONTROL_TIMEOUT,
            )
            .with_context(|_| ErrorKind::Usb(format!("control read {:#04x} failed", request)))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn bulk_write(&self, endpoint: u8, data: &[u8]) -> error::Result<usize> {
        let sent = self
            .handle
            .write_bulk(endpoint, data, config::BULK_TIMEOUT)
            .with_context(|_| {
                ErrorKind::Usb(format!("bulk write to endpoint {:#04x} failed", endpoint))
            })?;
        Ok(sent)
    }

    fn claim_interface(&mut self, iface: u8) -> error::Result<()> {
        self.handle
            .claim_interface(iface)
            .with_context(|_| ErrorKind::Usb(format!("cannot claim interface {}", iface)))?;
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> error::Result<()> {
        self.handle
            .release_interface(iface)
            .with_context(|_| ErrorKind::Usb(format!("cannot release interface {}", iface)))?;
        Ok(())
    }

    fn ids(&self) -> (u16, u16) {
        (self.vendor_id, self.product_id)
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }
}

fn read_serial(
    handle: &libusb::DeviceHandle,
    descriptor: &libusb::DeviceDescriptor,
    timeout: Duration,
) -> Option<String> {
    let languages = handle.read_languages(timeout).ok()?;
    let language = *languages.first()?;
    handle
        .read_serial_number_string(language, descriptor, timeout)
        .ok()
        .map(|serial| serial.trim_matches('\0').to_string())
}

/// Enumerate all attached ZTEX boards, optionally restricted to one serial
/// number. Devices that cannot be opened or configured are skipped with a
/// warning, they may simply be claimed by another process.
pub fn scan(serial: Option<&str>) -> error::Result<Vec<UsbTransport>> {
    let devices = USB_CONTEXT
        .devices()
        .context(ErrorKind::Usb("cannot enumerate USB bus".to_string()))?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != ZTEX_VENDOR_ID || descriptor.product_id() != ZTEX_PRODUCT_ID {
            continue;
        }

        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    LOGGER,
                    "cannot open device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        if let Err(e) = handle.set_active_configuration(1) {
            warn!(
                LOGGER,
                "cannot configure device {:03}:{:03}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            continue;
        }

        let device_serial = read_serial(&handle, &descriptor, config::CONTROL_TIMEOUT);
        if let Some(wanted) = serial {
            if device_serial.as_ref().map(|s| s.as_str()) != Some(wanted) {
                continue;
            }
        }

        info!(
            LOGGER,
            "found ZTEX board at {:03}:{:03} (serial {})",
            device.bus_number(),
            device.address(),
            device_serial.as_ref().map(|s| s.as_str()).unwrap_or("n/a")
        );
        found.push(UsbTransport {
            handle,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial: device_serial,
        });
    }

    Ok(found)
}

#[cfg(test)]
pub mod test {
    use super::*;

    use crate::device;

    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Scriptable state of an in-memory device standing in for real hardware
    pub struct MockState {
        pub fw_descriptor: Vec<u8>,
        pub miner_descriptor: Vec<u8>,
        pub hs_settings: Vec<u8>,
        /// Result block returned before the first job was sent
        pub nonce_idle: Vec<u8>,
        /// Result block returned once at least one job was sent
        pub nonce_after_job: Vec<u8>,
        pub configured: bool,
        /// Upload size that completes a configuration pass
        pub expected_bytes: u32,
        /// Number of upload passes to spoil before the DONE pin goes high
        pub fail_passes: u32,
        pub pass_spoiled: bool,
        pub checksum: u8,
        pub transferred: u32,
        pub resets: u32,
        /// Vendor requests/commands that fail with a USB error
        pub fail_commands: HashSet<u8>,
        pub fail_bulk: bool,
        pub sent_jobs: Vec<Vec<u8>>,
        pub freq_history: Vec<u16>,
        pub bulk_chunks: Vec<usize>,
        pub claimed: Vec<u8>,
        pub released: Vec<u8>,
        pub ids: (u16, u16),
        pub serial: Option<String>,
    }

    pub fn mock_fw_descriptor() -> Vec<u8> {
        let mut buf = vec![40u8, 1];
        buf.extend_from_slice(b"ZTEX");
        // product ID 10.13.1.1 (mining firmware family)
        buf.extend_from_slice(&[10, 13, 1, 1]);
        // firmware and interface version
        buf.extend_from_slice(&[0, 1]);
        // capabilities: EEPROM, FPGA, HS_FPGA
        buf.extend_from_slice(&[0x23, 0, 0, 0, 0, 0]);
        buf.resize(40, 0);
        buf
    }

    pub fn mock_miner_descriptor() -> Vec<u8> {
        let mut buf = vec![
            4u8,  // descriptor version
            0,    // numNonces - 1
        ];
        buf.extend_from_slice(&10000u16.to_le_bytes()); // offsNonces bias
        buf.extend_from_slice(&400u16.to_le_bytes()); // 4.00 MHz per clock step
        buf.push(180); // default frequency multiplier
        buf.push(220); // maximal frequency multiplier
        buf.extend_from_slice(&127u16.to_le_bytes()); // HASHES_PER_CLOCK = 1.0
        buf.extend_from_slice(b"ztex_ufm1_15d4\0");
        buf.resize(64, 0);
        buf
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                fw_descriptor: mock_fw_descriptor(),
                miner_descriptor: mock_miner_descriptor(),
                hs_settings: vec![2, 0],
                nonce_idle: vec![0; 12],
                nonce_after_job: vec![0; 12],
                configured: false,
                expected_bytes: 0,
                fail_passes: 0,
                pass_spoiled: false,
                checksum: 0,
                transferred: 0,
                resets: 0,
                fail_commands: HashSet::new(),
                fail_bulk: false,
                sent_jobs: Vec::new(),
                freq_history: Vec::new(),
                bulk_chunks: Vec::new(),
                claimed: Vec::new(),
                released: Vec::new(),
                ids: (ZTEX_VENDOR_ID, ZTEX_PRODUCT_ID),
                serial: Some("TEST01".to_string()),
            }
        }
    }

    impl MockState {
        fn begin_pass(&mut self) {
            self.configured = false;
            self.checksum = 0;
            self.transferred = 0;
            self.pass_spoiled = self.fail_passes > 0;
            if self.fail_passes > 0 && self.fail_passes != u32::max_value() {
                self.fail_passes -= 1;
            }
        }

        fn accept_data(&mut self, data: &[u8]) {
            self.transferred += data.len() as u32;
            self.checksum = data.iter().fold(self.checksum, |cs, &b| cs.wrapping_add(b));
            if !self.pass_spoiled
                && self.expected_bytes > 0
                && self.transferred >= self.expected_bytes
            {
                self.configured = true;
            }
        }
    }

    /// In-memory [`Transport`] driven by a shared [`MockState`]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState::default()));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl Transport for MockTransport {
        fn vendor_command(
            &self,
            request: u8,
            value: u16,
            _index: u16,
            data: &[u8],
        ) -> error::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.fail_commands.contains(&request) {
                Err(ErrorKind::Usb(format!(
                    "mock failure for command {:#04x}",
                    request
                )))?
            }
            match request {
                device::CMD_RESET_FPGA => {
                    state.resets += 1;
                    state.begin_pass();
                }
                device::CMD_SEND_FPGA_DATA => state.accept_data(data),
                device::CMD_INIT_HS_CONFIG => state.begin_pass(),
                device::CMD_FINISH_HS_CONFIG => (),
                device::CMD_SEND_HASH_DATA => state.sent_jobs.push(data.to_vec()),
                device::CMD_SET_FREQ => state.freq_history.push(value),
                _ => (),
            }
            Ok(data.len())
        }

        fn vendor_request(
            &self,
            request: u8,
            _value: u16,
            _index: u16,
            len: usize,
        ) -> error::Result<Vec<u8>> {
            let state = self.state.lock().unwrap();
            if state.fail_commands.contains(&request) {
                Err(ErrorKind::Usb(format!(
                    "mock failure for request {:#04x}",
                    request
                )))?
            }
            let mut buf = match request {
                device::REQ_READ_FW_DESCRIPTOR => state.fw_descriptor.clone(),
                device::REQ_READ_MINER_DESCRIPTOR => state.miner_descriptor.clone(),
                device::REQ_GET_HS_SETTINGS => state.hs_settings.clone(),
                device::REQ_GET_FPGA_STATE => {
                    let mut buf = vec![if state.configured { 0 } else { 1 }, state.checksum];
                    buf.extend_from_slice(&state.transferred.to_le_bytes());
                    buf.extend_from_slice(&[0, 0, 0]);
                    buf
                }
                device::REQ_READ_HASH_DATA => {
                    if state.sent_jobs.is_empty() {
                        state.nonce_idle.clone()
                    } else {
                        state.nonce_after_job.clone()
                    }
                }
                _ => Vec::new(),
            };
            buf.truncate(len);
            Ok(buf)
        }

        fn bulk_write(&self, _endpoint: u8, data: &[u8]) -> error::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.fail_bulk {
                Err(ErrorKind::Usb("mock bulk failure".to_string()))?
            }
            state.bulk_chunks.push(data.len());
            state.accept_data(data);
            Ok(data.len())
        }

        fn claim_interface(&mut self, iface: u8) -> error::Result<()> {
            self.state.lock().unwrap().claimed.push(iface);
            Ok(())
        }

        fn release_interface(&mut self, iface: u8) -> error::Result<()> {
            self.state.lock().unwrap().released.push(iface);
            Ok(())
        }

        fn ids(&self) -> (u16, u16) {
            self.state.lock().unwrap().ids
        }

        fn serial(&self) -> Option<String> {
            self.state.lock().unwrap().serial.clone()
        }
    }

    /// Little endian encoding of one result register slot
    pub fn nonce_slot(golden: u32, nonce: u32, hash7: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&golden.to_le_bytes());
        buf.extend_from_slice(&nonce.to_le_bytes());
        buf.extend_from_slice(&hash7.to_le_bytes());
        buf
    }
}
