use bitfield_struct::bitfield;

/// `scause`: Supervisor Cause Register (RV64).
///
/// The top bit distinguishes interrupts from synchronous exceptions; the
/// remaining bits carry the cause code.
#[bitfield(u64)]
pub struct Scause {
    /// Bits 0–62: exception or interrupt code.
    #[bits(63)]
    pub code: u64,

    /// Bit 63: set for interrupts.
    pub interrupt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_bit() {
        let timer = Scause::from_bits((1 << 63) | 5);
        assert!(timer.interrupt());
        assert_eq!(timer.code(), 5);

        let store_fault = Scause::from_bits(15);
        assert!(!store_fault.interrupt());
        assert_eq!(store_fault.code(), 15);
    }
}
