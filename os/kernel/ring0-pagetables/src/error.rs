/// Recoverable page-table failures.
///
/// Invariant violations (non-canonical ranges, converting a live leaf into an
/// intermediate entry, unaligned physical addresses) are not errors; they
/// abort.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageTablesError {
    #[error("out of memory (entry array)")]
    OutOfMemory,
}
