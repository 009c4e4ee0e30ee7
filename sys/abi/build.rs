// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emits the port configuration as consts.
//!
//! The host application configures the layer through environment variables at
//! build time; anything not set falls back to a default that matches the
//! reference port (72 MHz core clock, 1 kHz systick, 16 signal bits).

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

fn env_u32(name: &str, default: u32) -> u32 {
    println!("cargo:rerun-if-env-changed={}", name);
    match env::var(name) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{} must be an integer, got {:?}", name, v)),
        Err(_) => default,
    }
}

fn main() {
    let system_clock_hz = env_u32("STRAND_SYSTEM_CLOCK_HZ", 72_000_000);
    let systick_hz = env_u32("STRAND_SYSTICK_HZ", 1_000);
    let max_signals = env_u32("STRAND_MAX_SIGNALS", 16);
    let default_stack_size = env_u32("STRAND_DEFAULT_STACK_SIZE", 0);

    // The chained clock multiplies tick counts by the reload value, so the
    // fast clock must be an integer multiple of the slow one.
    if systick_hz == 0 || system_clock_hz % systick_hz != 0 {
        panic!(
            "STRAND_SYSTEM_CLOCK_HZ ({}) must be an integer multiple of \
             STRAND_SYSTICK_HZ ({})",
            system_clock_hz, systick_hz
        );
    }
    if !(1..=16).contains(&max_signals) {
        panic!("STRAND_MAX_SIGNALS must be in 1..=16, got {}", max_signals);
    }

    let out = PathBuf::from(env::var("OUT_DIR").unwrap()).join("config.rs");
    let mut f = File::create(&out).unwrap();
    writeln!(f, "pub const SYSTEM_CLOCK_HZ: u32 = {};", system_clock_hz).unwrap();
    writeln!(f, "pub const SYSTICK_HZ: u32 = {};", systick_hz).unwrap();
    writeln!(f, "pub const MAX_SIGNALS: u32 = {};", max_signals).unwrap();
    writeln!(
        f,
        "pub const DEFAULT_STACK_SIZE: usize = {};",
        default_stack_size
    )
    .unwrap();
}
