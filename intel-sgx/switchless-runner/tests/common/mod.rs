/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(dead_code)]

use std::convert::TryInto;
use std::time::Duration;

use anyhow::ensure;
use switchless_runner::marshal::{expect_len, read_padded_str, write_padded_str};
use switchless_runner::sim::Simulator;
use switchless_runner::{Direction, EdgeCall, MarshalError, OutputBuffer, SessionBuilder, SwitchlessConfig};

pub const STRING_LEN: usize = 100;

macro_rules! echo_call {
    ($name:ident, $id:expr, $direction:expr, $switchless:expr) => {
        pub struct $name;

        impl EdgeCall for $name {
            const ID: u32 = $id;
            const DIRECTION: Direction = $direction;
            const ARG_SIZE: usize = STRING_LEN;
            const SWITCHLESS: bool = $switchless;

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
    };
}

echo_call!(EchoEcall, 1, Direction::Ecall, true);
echo_call!(RegularEchoEcall, 2, Direction::Ecall, false);
echo_call!(EchoOcall, 1, Direction::Ocall, true);
echo_call!(RegularEchoOcall, 2, Direction::Ocall, false);
echo_call!(RelayEcall, 4, Direction::Ecall, true);
echo_call!(ChainEcall, 5, Direction::Ecall, true);
echo_call!(RelayOcall, 3, Direction::Ocall, true);

/// An ECALL that makes `count` echo OCALLs and returns how many came back
/// intact.
pub struct EchoLoop;

impl EdgeCall for EchoLoop {
    const ID: u32 = 3;
    const DIRECTION: Direction = Direction::Ecall;
    const ARG_SIZE: usize = 5;
    const SWITCHLESS: bool = false;

    /// (count, use switchless OCALLs)
    type Args = (u32, bool);
    type Output = u32;

    fn serialize_args(args: &(u32, bool), buf: &mut [u8]) -> Result<(), MarshalError> {
        buf[..4].copy_from_slice(&args.0.to_le_bytes());
        buf[4] = args.1 as u8;
        Ok(())
    }

    fn deserialize_args(buf: &[u8]) -> Result<(u32, bool), MarshalError> {
        expect_len(buf, Self::ARG_SIZE)?;
        let count = u32::from_le_bytes(buf[..4].try_into().unwrap());
        Ok((count, buf[4] != 0))
    }

    fn serialize_output(output: &u32, out: &mut OutputBuffer) -> Result<(), MarshalError> {
        out.write(&output.to_le_bytes())
    }

    fn deserialize_output(buf: &[u8]) -> Result<u32, MarshalError> {
        expect_len(buf, 4)?;
        Ok(u32::from_le_bytes(buf.try_into().unwrap()))
    }
}

/// Registers echo handlers for every call above.
pub fn register_echo(builder: &mut SessionBuilder) {
    builder
        .register::<EchoEcall, _>(|_, s| Ok(s))
        .register::<RegularEchoEcall, _>(|_, s| Ok(s))
        .register::<EchoOcall, _>(|_, s| Ok(s))
        .register::<RegularEchoOcall, _>(|_, s| Ok(s))
        .register::<EchoLoop, _>(|ctx, (count, switchless)| {
            let mut echoed = 0;
            for i in 0..count {
                let msg = format!("Hello World {}", i);
                let out = if switchless {
                    ctx.call::<EchoOcall>(&msg)?
                } else {
                    ctx.call::<RegularEchoOcall>(&msg)?
                };
                ensure!(out == msg, "echo mismatch: {:?} != {:?}", out, msg);
                echoed += 1;
            }
            Ok(echoed)
        });
}

/// `RelayEcall` forwards its argument to `EchoEcall`, back into the queue it
/// came from. `ChainEcall` forwards through `RelayOcall`, which then makes an
/// `EchoEcall` of its own.
pub fn register_relays(builder: &mut SessionBuilder) {
    builder
        .register::<RelayEcall, _>(|ctx, s| Ok(ctx.call::<EchoEcall>(&s)?))
        .register::<RelayOcall, _>(|ctx, s| Ok(ctx.call::<EchoEcall>(&s)?))
        .register::<ChainEcall, _>(|ctx, s| Ok(ctx.call::<RelayOcall>(&s)?));
}

pub fn both_directions(workers: usize, queue_depth: usize) -> SwitchlessConfig {
    SwitchlessConfig {
        enable_switchless_ecalls: true,
        enable_switchless_ocalls: true,
        host_worker_count: workers,
        enclave_worker_count: workers,
        queue_depth,
        ..Default::default()
    }
}

pub fn echo_builder(config: SwitchlessConfig) -> SessionBuilder {
    let mut builder = SessionBuilder::new("echo.sgxs");
    builder.config(config);
    register_echo(&mut builder);
    builder
}

pub fn simulator() -> Simulator {
    Simulator::with_transition_cost(Duration::from_micros(2))
}
