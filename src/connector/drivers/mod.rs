// SPDX-License-Identifier: Apache-2.0

// Store adapters

pub mod memory;
pub mod mongodb;
pub mod postgres;
pub mod redis;
pub mod search;
