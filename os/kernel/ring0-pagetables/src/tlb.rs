/// Translation-cache invalidation, scoped to one address-space tag.
///
/// Implemented by the execution backend. [`flush_global`](Self::flush_global)
/// must not return before every CPU has dropped the tag's translations;
/// the ASID allocator relies on it before handing a tag to a new owner.
pub trait TranslationCache {
    /// Drop translations tagged `asid` on the calling CPU.
    fn flush_local(&self, asid: u16);

    /// Drop translations tagged `asid` on every CPU.
    fn flush_global(&self, asid: u16);
}

impl<T: TranslationCache + ?Sized> TranslationCache for &T {
    #[inline]
    fn flush_local(&self, asid: u16) {
        (**self).flush_local(asid);
    }

    #[inline]
    fn flush_global(&self, asid: u16) {
        (**self).flush_global(asid);
    }
}
