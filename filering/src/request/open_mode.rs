use bitflags::bitflags;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

bitflags! {
    /// Generic open-mode flags, translated to native `open(2)` flags when the
    /// request is encoded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const READ_ONLY = 1;
        const WRITE_ONLY = 1 << 1;
        const READ_WRITE = Self::READ_ONLY.bits() | Self::WRITE_ONLY.bits();

        /// All writes go to the end of the file.
        const APPEND = 1 << 2;

        /// Truncate an existing file to zero length.
        const TRUNCATE = 1 << 3;

        /// Fail if the file already exists.
        const NEW_ONLY = 1 << 4;

        /// Fail if the file does not exist. Without it, opening for writing
        /// creates the file.
        const EXISTING_ONLY = 1 << 5;
    }
}

impl OpenMode {
    pub fn to_oflag(self) -> OFlag {
        let mut flags = if self.contains(OpenMode::READ_WRITE) {
            OFlag::O_RDWR
        } else if self.contains(OpenMode::WRITE_ONLY) {
            OFlag::O_WRONLY
        } else {
            OFlag::O_RDONLY
        };

        flags |= OFlag::O_CLOEXEC;

        if self.contains(OpenMode::WRITE_ONLY) && !self.contains(OpenMode::EXISTING_ONLY) {
            flags |= OFlag::O_CREAT;
        }

        if self.contains(OpenMode::TRUNCATE) {
            flags |= OFlag::O_TRUNC;
        }

        if self.contains(OpenMode::APPEND) {
            flags |= OFlag::O_APPEND;
        }

        if self.contains(OpenMode::NEW_ONLY) {
            flags |= OFlag::O_EXCL;
        }

        flags
    }

    /// Permission bits for newly created files, before umask.
    pub(crate) fn create_mode() -> Mode {
        Mode::from_bits_truncate(0o666)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::read_only(OpenMode::READ_ONLY, OFlag::O_RDONLY)]
    #[case::empty(OpenMode::empty(), OFlag::O_RDONLY)]
    #[case::write_only(OpenMode::WRITE_ONLY, OFlag::O_WRONLY | OFlag::O_CREAT)]
    #[case::read_write(OpenMode::READ_WRITE, OFlag::O_RDWR | OFlag::O_CREAT)]
    #[case::existing_only(
        OpenMode::WRITE_ONLY | OpenMode::EXISTING_ONLY,
        OFlag::O_WRONLY
    )]
    #[case::truncate(
        OpenMode::WRITE_ONLY | OpenMode::TRUNCATE,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
    )]
    #[case::append(
        OpenMode::WRITE_ONLY | OpenMode::APPEND,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND
    )]
    #[case::new_only(
        OpenMode::READ_WRITE | OpenMode::NEW_ONLY,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL
    )]
    fn test_to_oflag(#[case] mode: OpenMode, #[case] expected: OFlag) {
        assert_eq!(mode.to_oflag(), expected | OFlag::O_CLOEXEC);
    }
}
