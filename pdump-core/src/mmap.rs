//! Memory-mapping layer: reserve a contiguous address range, then map the
//! dump's three sections into it with correct per-section protections,
//! falling back to a malloc+read strategy where `mmap` tricks aren't
//! available.
//!
//! The three sections (hot, discardable, cold) must land contiguously so
//! that dump-relative offsets double as pointer offsets from one mapped
//! base. A single `mmap` over the whole file would already be contiguous,
//! but the original widens each section's mapping independently (the
//! discardable section, for instance, is `madvise(DONTNEED)`-able on its
//! own once relocations are applied) — we reproduce that by reserving one
//! anonymous `PROT_NONE` range up front and replacing it section-by-section
//! with `MAP_FIXED` file-backed mappings, matching spec §4.8 step 4.

use std::fs::File;
use std::io;

/// Byte extents of the three sections within the dump file (and, once
/// mapped, within the mapped range — both are the same numbers, since the
/// mapping is contiguous and starts at file offset 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionLayout {
    pub hot_end: usize,
    pub discardable_end: usize,
    pub total_len: usize,
}

impl SectionLayout {
    pub fn hot(&self) -> std::ops::Range<usize> {
        0..self.hot_end
    }

    pub fn discardable(&self) -> std::ops::Range<usize> {
        self.hot_end..self.discardable_end
    }

    pub fn cold(&self) -> std::ops::Range<usize> {
        self.discardable_end..self.total_len
    }
}

/// The backing storage for a loaded dump: either a live `mmap` over the
/// file, mapped contiguously section-by-section, or (when the `mmap`
/// feature is disabled, or reservation failed) a plain heap buffer read
/// in wholesale.
pub enum MappedDump {
    #[cfg(feature = "mmap")]
    Mapped(self::imp::Reservation),
    Owned(Vec<u8>),
}

impl MappedDump {
    /// Map `file`'s sections contiguously with read-write protection
    /// throughout (copy-on-write where the platform provides it). Falls
    /// back to [`Self::read_fallback`] if the `mmap` feature is disabled.
    pub fn map_sections(file: &File, layout: SectionLayout) -> io::Result<Self> {
        #[cfg(feature = "mmap")]
        {
            match self::imp::map_contiguous(file, layout) {
                Ok(reservation) => return Ok(MappedDump::Mapped(reservation)),
                Err(_) => return Self::read_fallback(file, layout),
            }
        }
        #[cfg(not(feature = "mmap"))]
        {
            Self::read_fallback(file, layout)
        }
    }

    /// Read the whole dump into a heap buffer. Used when `mmap` is
    /// unavailable or refused.
    pub fn read_fallback(mut file: &File, layout: SectionLayout) -> io::Result<Self> {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = vec![0u8; layout.total_len];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        Ok(MappedDump::Owned(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            #[cfg(feature = "mmap")]
            MappedDump::Mapped(r) => r.as_slice(),
            MappedDump::Owned(buf) => buf.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            #[cfg(feature = "mmap")]
            MappedDump::Mapped(r) => r.as_mut_slice(),
            MappedDump::Owned(buf) => buf.as_mut_slice(),
        }
    }

    /// Advise the discardable range away once every relocation that reads
    /// it has run (spec §4.8 step 8). A no-op for the malloc+read
    /// fallback, which has nothing the OS can reclaim on its own.
    pub fn discard(&mut self, range: std::ops::Range<usize>) {
        #[cfg(feature = "mmap")]
        if let MappedDump::Mapped(r) = self {
            r.advise_dontneed(range);
        }
        let _ = range;
    }
}

#[cfg(feature = "mmap")]
mod imp {
    use super::SectionLayout;
    use std::ffi::c_void;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// A contiguous anonymous reservation, progressively replaced by
    /// file-backed `MAP_FIXED` mappings, one per section.
    pub struct Reservation {
        base: *mut u8,
        len: usize,
    }

    // The mapping is exclusively owned by `Reservation` and never aliased
    // outside the accessors below.
    unsafe impl Send for Reservation {}

    impl Reservation {
        pub fn as_slice(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.base, self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
        }

        pub fn advise_dontneed(&mut self, range: std::ops::Range<usize>) {
            if range.is_empty() {
                return;
            }
            unsafe {
                let addr = self.base.add(range.start) as *mut c_void;
                libc::madvise(addr, range.len(), libc::MADV_DONTNEED);
            }
        }
    }

    impl Drop for Reservation {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut c_void, self.len);
            }
        }
    }

    /// Reserve `layout.total_len` bytes of address space, then replace it
    /// with three file-backed `MAP_FIXED` mappings covering hot,
    /// discardable, and cold in turn. Retries the whole dance on `EBUSY`,
    /// which some platforms report when a concurrent mapper raced us for
    /// the reservation.
    pub fn map_contiguous(file: &std::fs::File, layout: SectionLayout) -> io::Result<Reservation> {
        const MAX_ATTEMPTS: u32 = 8;
        let mut last_err = io::Error::new(io::ErrorKind::Other, "mmap reservation failed");
        for _ in 0..MAX_ATTEMPTS {
            match try_map_once(file, layout) {
                Ok(reservation) => return Ok(reservation),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    last_err = e;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn try_map_once(file: &std::fs::File, layout: SectionLayout) -> io::Result<Reservation> {
        unsafe {
            let reservation = libc::mmap(
                std::ptr::null_mut(),
                layout.total_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reservation == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let fd = file.as_raw_fd();
            let sections = [layout.hot(), layout.discardable(), layout.cold()];
            for section in sections {
                if section.is_empty() {
                    continue;
                }
                let addr = (reservation as *mut u8).add(section.start) as *mut c_void;
                let mapped = libc::mmap(
                    addr,
                    section.len(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_FIXED,
                    fd,
                    section.start as libc::off_t,
                );
                if mapped == libc::MAP_FAILED {
                    let err = io::Error::last_os_error();
                    libc::munmap(reservation, layout.total_len);
                    return Err(err);
                }
            }

            Ok(Reservation {
                base: reservation as *mut u8,
                len: layout.total_len,
            })
        }
    }
}
