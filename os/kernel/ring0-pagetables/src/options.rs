use core::fmt;

/// Access permissions of a mapping or a fault.
///
/// Read is implicit for any valid leaf entry; write and execute are explicit.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AccessType {
    pub const NONE: Self = Self::new(false, false, false);
    pub const READ: Self = Self::new(true, false, false);
    pub const READ_WRITE: Self = Self::new(true, true, false);
    pub const READ_EXECUTE: Self = Self::new(true, false, true);
    pub const ANY: Self = Self::new(true, true, true);

    #[inline]
    #[must_use]
    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    /// Returns `true` if any permission is granted.
    #[inline]
    #[must_use]
    pub const fn any(self) -> bool {
        self.read || self.write || self.execute
    }
}

impl fmt::Debug for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        let x = if self.execute { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Options for a leaf mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MapOpts {
    /// Requested permissions. An empty set means "unmapped".
    pub access: AccessType,

    /// Translation is shared by every address-space tag.
    pub global: bool,

    /// Accessible from sandboxed (user) mode.
    pub user: bool,
}

impl MapOpts {
    #[inline]
    #[must_use]
    pub const fn user(access: AccessType) -> Self {
        Self {
            access,
            global: false,
            user: true,
        }
    }

    /// The options a valid entry reads back as: read is implied by any
    /// other permission.
    #[inline]
    #[must_use]
    pub const fn normalized(mut self) -> Self {
        if self.access.any() {
            self.access.read = true;
        }
        self
    }

    #[inline]
    #[must_use]
    pub const fn kernel(access: AccessType) -> Self {
        Self {
            access,
            global: true,
            user: false,
        }
    }
}
