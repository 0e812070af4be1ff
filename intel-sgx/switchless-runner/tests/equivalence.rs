/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod common;

use std::time::{Duration, Instant};

use common::*;
use switchless_runner::sim::Simulator;

const NUM_CALLS: usize = 100_000;

#[test]
fn switchless_and_trapped_agree() {
    let sim = simulator();
    let session = echo_builder(both_directions(1, 4)).build(&sim).unwrap();

    let switchless = (0..NUM_CALLS)
        .map(|i| session.call::<EchoEcall>(&format!("Hello World {}", i)).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(sim.transitions(), 0);

    for (i, switchless) in switchless.iter().enumerate() {
        let trapped = session.call::<RegularEchoEcall>(&format!("Hello World {}", i)).unwrap();
        assert_eq!(&trapped, switchless);
        assert_eq!(trapped, format!("Hello World {}", i));
    }

    let stats = session.stats();
    assert_eq!(stats.switchless_calls, NUM_CALLS as u64);
    assert_eq!(stats.trapped_calls, NUM_CALLS as u64);
    assert_eq!(sim.transitions(), NUM_CALLS as u64);
}

#[test]
fn switchless_is_faster() {
    // The caller and the worker each need a core of their own.
    if num_cpus::get() < 2 {
        println!("skipped: needs at least 2 CPUs");
        return;
    }
    let sim = Simulator::with_transition_cost(Simulator::DEFAULT_TRANSITION_COST);
    let session = echo_builder(both_directions(1, 4)).build(&sim).unwrap();
    let msg = "Hello World".to_owned();

    let time = |f: &dyn Fn()| {
        let start = Instant::now();
        for _ in 0..NUM_CALLS {
            f();
        }
        start.elapsed() / NUM_CALLS as u32
    };
    let switchless = time(&|| {
        session.call::<EchoEcall>(&msg).unwrap();
    });
    let trapped = time(&|| {
        session.call::<RegularEchoEcall>(&msg).unwrap();
    });
    println!("switchless: {:?}/call, trapped: {:?}/call", switchless, trapped);
    assert!(switchless < trapped);
    assert!(trapped >= Duration::from_micros(5));
}
