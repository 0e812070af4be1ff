/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::convert::TryInto;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use clap::{App, Arg};
use log::info;

use switchless_runner::marshal::{expect_len, read_padded_str, write_padded_str};
use switchless_runner::sim::Simulator;
use switchless_runner::{
    global_stats, CreateFlags, Direction, EdgeCall, MarshalError, OutputBuffer, SessionBuilder, SwitchlessConfig,
};

const STRING_LEN: usize = 100;

struct EchoOcall<const S: bool>;

impl<const S: bool> EdgeCall for EchoOcall<S> {
    const ID: u32 = if S { 1 } else { 2 };
    const DIRECTION: Direction = Direction::Ocall;
    const ARG_SIZE: usize = STRING_LEN;
    const SWITCHLESS: bool = S;

    type Args = String;
    type Output = String;

    fn serialize_args(args: &String, buf: &mut [u8]) -> Result<(), MarshalError> {
        write_padded_str(args, buf)
    }

    fn deserialize_args(buf: &[u8]) -> Result<String, MarshalError> {
        read_padded_str(buf).map(str::to_owned)
    }

    fn serialize_output(output: &String, out: &mut OutputBuffer) -> Result<(), MarshalError> {
        out.write_str(output)
    }

    fn deserialize_output(buf: &[u8]) -> Result<String, MarshalError> {
        read_padded_str(buf).map(str::to_owned)
    }
}

/// Runs a number of echo OCALLs from inside the enclave.
struct EchoLoop;

impl EdgeCall for EchoLoop {
    const ID: u32 = 1;
    const DIRECTION: Direction = Direction::Ecall;
    const ARG_SIZE: usize = 5;
    const SWITCHLESS: bool = false;

    type Args = (u32, bool);
    type Output = ();

    fn serialize_args(args: &(u32, bool), buf: &mut [u8]) -> Result<(), MarshalError> {
        buf[..4].copy_from_slice(&args.0.to_le_bytes());
        buf[4] = args.1 as u8;
        Ok(())
    }

    fn deserialize_args(buf: &[u8]) -> Result<(u32, bool), MarshalError> {
        expect_len(buf, Self::ARG_SIZE)?;
        let count = buf[..4]
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|e| MarshalError::Malformed(format!("{}", e)))?;
        Ok((count, buf[4] != 0))
    }

    fn serialize_output(_: &(), _: &mut OutputBuffer) -> Result<(), MarshalError> {
        Ok(())
    }

    fn deserialize_output(buf: &[u8]) -> Result<(), MarshalError> {
        expect_len(buf, 0)
    }
}

fn parse_num<T: std::str::FromStr>(s: String) -> Result<(), String> {
    s.parse::<T>().map(|_| ()).map_err(|_| format!("{:?} is not a number", s))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("switchless-echo")
        .about("Compares switchless and regular OCALLs in a simulated enclave")
        .arg(
            Arg::with_name("host-threads")
                .validator(parse_num::<usize>)
                .help("Host workers servicing switchless OCALLs (default: 2)"),
        )
        .arg(
            Arg::with_name("enclave-threads")
                .validator(parse_num::<usize>)
                .help("Enclave threads making OCALLs (default: 1)"),
        )
        .arg(
            Arg::with_name("calls")
                .long("calls")
                .takes_value(true)
                .validator(parse_num::<u32>)
                .help("OCALLs per enclave thread and mode (default: 100000)"),
        )
        .arg(
            Arg::with_name("transition-cost")
                .long("transition-cost")
                .takes_value(true)
                .validator(parse_num::<u64>)
                .help("Simulated cost of a mode transition in nanoseconds"),
        )
        .get_matches();

    let num = |name: &'static str, default: usize| -> anyhow::Result<usize> {
        matches.value_of(name).map_or(Ok(default), |v| v.parse().context(name))
    };
    let host_threads = num("host-threads", 2)?;
    let enclave_threads = num("enclave-threads", 1)?;
    let calls = num("calls", 100_000)? as u32;
    let cost = match matches.value_of("transition-cost") {
        Some(ns) => Duration::from_nanos(ns.parse()?),
        None => Simulator::DEFAULT_TRANSITION_COST,
    };

    let config = SwitchlessConfig {
        enable_switchless_ocalls: true,
        host_worker_count: host_threads,
        queue_depth: host_threads.max(enclave_threads),
        ..Default::default()
    };
    let mut builder = SessionBuilder::new("switchless-echo.sgxs");
    builder
        .flags(CreateFlags::SIMULATE | CreateFlags::DEBUG)
        .config(config)
        .register::<EchoOcall<true>, _>(|_, s| Ok(s))
        .register::<EchoOcall<false>, _>(|_, s| Ok(s))
        .register::<EchoLoop, _>(|ctx, (count, switchless)| {
            let msg = "Hello World".to_owned();
            for _ in 0..count {
                let out = if switchless {
                    ctx.call::<EchoOcall<true>>(&msg)?
                } else {
                    ctx.call::<EchoOcall<false>>(&msg)?
                };
                ensure!(out == msg, "echo returned {:?}", out);
            }
            Ok(())
        });
    let session = builder.build(&Simulator::with_transition_cost(cost))?;

    let run = |switchless| -> anyhow::Result<Duration> {
        let start = Instant::now();
        crossbeam::scope(|s| {
            let threads = (0..enclave_threads)
                .map(|_| s.spawn(|_| session.call::<EchoLoop>(&(calls, switchless))))
                .collect::<Vec<_>>();
            threads
                .into_iter()
                .map(|t| t.join().map_err(|_| anyhow::format_err!("enclave thread panicked"))?.map_err(Into::into))
                .collect::<anyhow::Result<()>>()
        })
        .map_err(|_| anyhow::format_err!("enclave thread panicked"))??;
        Ok(start.elapsed())
    };

    let switchless = run(true)?;
    let regular = run(false)?;
    session.terminate()?;

    let total = calls as u64 * enclave_threads as u64;
    let switchless_calls = session.invocations(Direction::Ocall, EchoOcall::<true>::ID).unwrap_or(0);
    ensure!(switchless_calls == total, "{} of {} switchless OCALLs ran", switchless_calls, total);

    println!("{} host workers, {} enclave threads, {} OCALLs each", host_threads, enclave_threads, calls);
    println!("Time spent in switchless OCALLs: {:?}", switchless);
    println!("Time spent in regular OCALLs: {:?}", regular);
    if switchless > Duration::from_secs(0) {
        println!("Switchless speed-up: {:.2}x", regular.as_secs_f64() / switchless.as_secs_f64());
    }
    print!("{}", session.stats().pretty_format()?);
    info!("Process totals:\n{}", global_stats().pretty_format()?);
    Ok(())
}
