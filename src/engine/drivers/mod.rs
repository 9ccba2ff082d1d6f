// SPDX-License-Identifier: Apache-2.0

// Backend drivers module

pub mod memory;
pub mod postgres;
pub mod sqlite;
