// SPDX-License-Identifier: Apache-2.0

//! Export of federated results

pub mod csv;

pub use self::csv::{default_file_name, export_to_file, write_csv};
