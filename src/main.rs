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

use ztexminer::config::Config;
use ztexminer::hotplug::HotplugManager;
use ztexminer::job::NullWorkSource;
use ztexminer::misc::LOGGER;

use clap::{self, Arg};
use slog::error;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

fn main() {
    let args = clap::App::new("ztexminer")
        .arg(
            Arg::with_name("serial")
                .short("s")
                .long("serial")
                .value_name("SERIAL")
                .help("Only drive the board with this serial number")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bitstreams")
                .short("b")
                .long("bitstreams")
                .value_name("DIR")
                .help("Directory the FPGA bitstream images are loaded from")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("job-interval")
                .value_name("SECONDS")
                .help("Upper bound on the per-job work interval")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ep0")
                .long("ep0")
                .help("Force the low speed (endpoint 0) FPGA configuration path"),
        )
        .arg(
            Arg::with_name("force")
                .long("force-bitstream")
                .help("Re-upload the bitstream even if the FPGA reports it is configured"),
        )
        .get_matches();

    let mut config = Config::default();
    if let Some(serial) = args.value_of("serial") {
        config.serial = Some(serial.to_string());
    }
    if let Some(dir) = args.value_of("bitstreams") {
        config.bitstream_dir = PathBuf::from(dir);
    }
    if let Some(interval) = args.value_of("interval") {
        config.job_interval_s = match interval.parse() {
            Ok(interval) => interval,
            Err(_) => {
                error!(LOGGER, "invalid job interval: {}", interval);
                process::exit(1);
            }
        };
    }
    config.ep0_force = args.is_present("ep0");
    config.force_bitstream = args.is_present("force");

    if let Err(e) = config.validate() {
        error!(LOGGER, "{}", e);
        process::exit(1);
    }

    // without a pool attached the boards chew on throwaway work; this keeps
    // the binary useful as a hardware exerciser
    let work_source = Arc::new(NullWorkSource::new());
    let manager = HotplugManager::new(config, work_source);
    manager.run();
}
