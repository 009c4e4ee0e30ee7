// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coarse-tick wrap behavior, isolated in its own process because it
//! repositions the hosted backend's tick counter.

use std::time::Duration;

use strand::time::HighResClock;

#[test]
fn s6_clock_crosses_the_coarse_wrap_monotonically() {
    // Park the coarse tick just shy of its wrap; at the default 1 kHz it
    // wraps about a quarter second from now.
    rtos::hosted::set_coarse_tick_base(0xFFFF_FF00);

    let start = HighResClock::now();
    let mut prev = start;
    for _ in 0..120 {
        std::thread::sleep(Duration::from_millis(5));
        let next = HighResClock::now();
        assert!(next > prev, "clock went backwards: {} -> {}", prev, next);
        prev = next;
    }

    // The window straddled the 2^32 coarse boundary and the fused value
    // kept counting: total advance matches the elapsed wall time.
    let elapsed_cycles = prev - start;
    let elapsed_secs = elapsed_cycles as f64 / HighResClock::FREQUENCY as f64;
    assert!(
        (0.5..=2.0).contains(&elapsed_secs),
        "implausible elapsed time {}s",
        elapsed_secs
    );
}
