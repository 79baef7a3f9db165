use thiserror::Error;

use crate::ir::{Address, OpId, Opcode, ValueId};

macro_rules! fatal_error {
    // Single string version
    ($addr:expr, $msg:expr) => {
        crate::Error::Fatal {
            addr: $addr,
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($addr:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Fatal {
            addr: $addr,
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use fatal_error;

/// The generic Error type, covering every failure the heritage and merge pipelines can
/// surface to the decompilation driver.
///
/// Only conditions that must abort the current function end up here. Imprecision in guard
/// analysis and speculative merge failures are absorbed locally and, where relevant, reported
/// through the [`crate::events::WarningSink`] instead.
///
/// # Error Categories
///
/// ## Fatal
/// - [`Error::Fatal`] - Broken invariant, annotated with the address of the offending operation
/// - [`Error::RangeOverlap`] - The disjoint storage-range map lost its disjointness
///
/// ## Subsystem failures
/// - [`Error::Merge`] - A required merge stayed illegal after every trim
///
/// ## Structure
/// - [`Error::Graph`] - The control-flow graph handed to the core is unusable
///
/// # Examples
///
/// ```rust,ignore
/// use heritage::{Error, Function, Heritage};
///
/// match heritage.heritage(&mut func) {
///     Ok(()) => {}
///     Err(Error::Fatal { addr, message, .. }) => eprintln!("{addr}: {message}"),
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// An internal invariant was violated while processing the operation at `addr`.
    ///
    /// Raised through the `fatal_error!` macro, which records the source location that
    /// detected the problem.
    #[error("Fatal at {addr} - {file}:{line}: {message}")]
    Fatal {
        /// Address of the operation being processed
        addr: Address,
        /// Description of the broken invariant
        message: String,
        /// Source file that raised the error
        file: &'static str,
        /// Source line that raised the error
        line: u32,
    },

    /// Two entries of the disjoint storage-range map overlap.
    #[error("Disjoint range invariant violated at {0}")]
    RangeOverlap(Address),

    /// A required merge could not be made legal.
    #[error("{0}")]
    Merge(#[from] MergeError),

    /// The control-flow graph is malformed.
    #[error("{0}")]
    Graph(String),
}

/// Reasons two logical variables cannot be merged.
///
/// The first five variants come from the non-Cover eligibility tests and are cheap to
/// evaluate. [`MergeError::CoverIntersection`] is the live-range conflict, and
/// [`MergeError::Exhausted`] means every trim strategy has already been tried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Both variables carry locked data-types that differ.
    #[error("Type locked variables disagree on data-type")]
    TypeLock,

    /// Both variables are tied to storage, but to different addresses.
    #[error("Address tied variables occupy different storage")]
    AddrTied,

    /// An input would merge with a persistent or address-tied variable.
    #[error("Input cannot share a variable with persistent or tied storage")]
    InputPersist,

    /// The variables are bound to different symbols, or to one symbol at different offsets.
    #[error("Symbol binding mismatch")]
    SymbolOffset,

    /// The variables belong to different overlap groups.
    #[error("Overlap group mismatch")]
    OverlapGroup,

    /// Instances of the two variables hold different values at the same time.
    #[error("Live ranges of {0} and {1} intersect")]
    CoverIntersection(ValueId, ValueId),

    /// A required merge on the given operation is still illegal after trimming every input
    /// and the output.
    #[error("Unable to force merge of op {0}")]
    Exhausted(OpId),
}

/// Reasons a pointer could not be traced back to a space base register.
///
/// Tracing is always optional: a LOAD or STORE whose pointer cannot be traced simply gets no
/// guard, so this type never reaches the crate-level [`Error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The pointer is not derived from the stack pointer input.
    #[error("Pointer does not derive from a space base")]
    UnknownBase,

    /// The pointer is produced by an operation the tracer does not follow.
    #[error("Cannot trace through {0}")]
    Unsupported(Opcode),

    /// The data-flow chain is deeper than the trace limit.
    #[error("Trace depth limit reached")]
    DepthLimit,
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
