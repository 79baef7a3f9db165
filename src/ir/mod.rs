//! Arena-based intermediate representation.
//!
//! A decompiled function is a graph of [`Op`]s reading and writing storage-addressed
//! [`Value`]s, grouped into [`Block`]s. Everything is owned by a single [`Function`] and
//! referenced through typed handles, which lets the heritage and merge passes edit the graph
//! freely without shared ownership.
//!
//! # Key Components
//!
//! - [`Function`] - Arena, per-function context and mutation API
//! - [`Value`] / [`Op`] / [`Block`] - The graph itself
//! - [`Address`] / [`Storage`] / [`AddrSpace`] - Where values live
//! - [`CallSpec`] / [`FuncProto`] - Call-site and prototype descriptors from the prototype
//!   collaborator
//! - [`Symbol`] - Symbol bindings from the naming collaborator

mod address;
mod block;
mod callspec;
mod function;
mod handle;
mod mutate;
mod op;
mod opcode;
mod symbol;
mod value;

pub use address::{AddrSpace, Address, SpaceKind, Storage};
pub(crate) use address::signed_within;
pub use block::{Block, BlockEdge};
pub use callspec::{CallSpec, Containment, EffectRecord, EffectType, FuncProto, ParamActive};
pub use function::Function;
pub(crate) use function::ORDER_STEP;
pub use handle::{BlockId, HighId, OpId, SpaceId, SymbolId, ValueId};
pub use op::{Op, OpFlags, SeqNum};
pub use opcode::Opcode;
pub use symbol::Symbol;
pub use value::{TypeId, Value, ValueFlags};
