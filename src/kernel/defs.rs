// Gets the bytes of a value, for shuttling fixed-layout records (disk
// blocks, ELF headers, directory entries) through byte-count I/O.
//
// # Safety:
// only for types whose memory layout is fixed (repr(C), no padding
// that must stay uninitialized).
pub unsafe fn as_bytes<T: ?Sized>(refs: &T) -> &[u8] {
    let len = core::mem::size_of_val(refs);
    core::slice::from_raw_parts(refs as *const T as *const u8, len)
}

// Gets the bytes of a value mutably.
//
// # Safety:
// as for as_bytes; additionally every bit pattern must be a valid T.
pub unsafe fn as_bytes_mut<T: ?Sized>(refs: &mut T) -> &mut [u8] {
    let len = core::mem::size_of_val(refs);
    core::slice::from_raw_parts_mut(refs as *mut T as *mut u8, len)
}
