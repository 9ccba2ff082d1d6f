// SPDX-License-Identifier: Apache-2.0

//! Cross-Backend Federation Engine
//!
//! Runs one SQL statement over tables that live in independent backends:
//! parse → resolve → plan per backend → fetch → merge → filter.

pub mod executor;
pub mod filter;
pub mod manager;
pub mod merger;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod rules;
pub mod types;

pub use manager::FederationEngine;
pub use rules::{JoinRule, JoinType};
pub use types::{FederatedResult, FederationPlan};
