// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # heritage
//!
//! The data-flow normalization core of a machine-code decompiler: SSA construction over
//! storage-addressed values ("heritage") and the merging of SSA values back into logical
//! variables.
//!
//! Decompiler IR does not name variables. An operation reads and writes *storage*: a byte
//! range in a register file, on the stack, in global memory or in a temporary space. Heritage
//! links every read of a storage location to the definition that reaches it, placing
//! phi-nodes (MULTIEQUAL) where control flow joins and making the implicit effects of calls,
//! returns and pointer-based memory accesses explicit (INDIRECT and guard COPYs). The merge
//! engine then groups the resulting SSA values into [`HighVariable`]s, splitting live ranges
//! with COPYs where a required grouping would otherwise hold two values at once.
//!
//! ## Architecture
//!
//! - [`ir`] - Arena-backed function graph: address spaces, values, operations, blocks and the
//!   mutation API every pass goes through
//! - [`graph`] - Graph traits and dominator-tree algorithms over basic blocks
//! - [`heritage`] - Pass driver, storage-range tracker, refinement, guards, phi placement and
//!   renaming
//! - [`cover`] - Live ranges and interference
//! - [`merge`] - Logical variables, required and speculative merges, COPY cleanup
//! - [`config`] - Tunables for both pipelines
//! - [`events`] - Deduplicated warnings attached to the function
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heritage::prelude::*;
//!
//! let mut func = Function::new("example", 0x1000);
//! let reg = func.add_space("register", SpaceKind::Register);
//! let entry = func.add_block(0x1000);
//! let eax = Storage::new(Address::new(reg, 0), 4);
//!
//! let one = func.new_const(4, 1);
//! func.push_op(entry, Opcode::Copy, 0x1000, &[one], Some(eax));
//! let read = func.new_value_at(eax);
//! func.push_op(entry, Opcode::Return, 0x1004, &[read], None);
//!
//! let config = HeritageConfig::default();
//! let mut heritage = Heritage::new(config.clone());
//! heritage.run(&mut func)?;
//!
//! let mut merge = Merge::new(config);
//! merge.run(&mut func)?;
//!
//! for event in func.warnings().warnings() {
//!     println!("{}: {}", event.addr, event.message);
//! }
//! # Ok::<(), heritage::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Fallible operations return [`Result`]. Broken internal invariants surface as
//! [`Error::Fatal`] with the address of the operation being processed; everything the
//! pipeline can degrade around is recorded in the function's [`WarningSink`] instead.

mod error;

pub mod config;
pub mod cover;
pub mod events;
pub mod graph;
pub mod heritage;
pub mod ir;
pub mod merge;

/// Convenient re-exports of the most commonly used types.
pub mod prelude {
    pub use crate::{
        config::HeritageConfig,
        cover::{Cover, Intersection},
        events::{Event, EventKind, WarningSink},
        heritage::Heritage,
        ir::{
            Address, BlockId, CallSpec, EffectType, Function, Opcode, OpId, SpaceKind, Storage,
            ValueFlags, ValueId,
        },
        merge::{HighVariable, Merge},
        Error, Result,
    };
}

pub use config::HeritageConfig;
pub use error::{Error, MergeError, Result, TraceError};
pub use events::{Event, EventKind, WarningSink};
pub use heritage::Heritage;
pub use merge::{HighVariable, Merge};
