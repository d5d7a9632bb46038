// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Proptest Strategies
//!
//! Reusable proptest strategies for property-based testing.

use proptest::prelude::*;

use pakconnect_core::transport::CHUNK_HEADER_SIZE;

/// Link units from barely-usable to a typical BLE MTU.
pub fn unit_size_strategy() -> impl Strategy<Value = usize> {
    (CHUNK_HEADER_SIZE + 1)..=247
}

/// A unit size and a payload up to ten units long.
pub fn unit_and_payload_strategy() -> impl Strategy<Value = (usize, Vec<u8>)> {
    unit_size_strategy().prop_flat_map(|unit| {
        (
            Just(unit),
            prop::collection::vec(any::<u8>(), 0..=unit * 10),
        )
    })
}

/// Hex ids shaped like node ids (64 chars).
pub fn node_id_strategy() -> impl Strategy<Value = String> {
    "[a-f0-9]{64}"
}
