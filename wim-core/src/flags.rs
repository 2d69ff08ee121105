//! Bit flag sets passed through to the engine unchanged.

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

flag_set! {
    /// Flags for the one-time engine initialization.
    InitFlags {
        DONT_ACQUIRE_PRIVILEGES = 0x0000_0002;
        STRICT_CAPTURE_PRIVILEGES = 0x0000_0004;
        STRICT_APPLY_PRIVILEGES = 0x0000_0008;
        DEFAULT_CASE_SENSITIVE = 0x0000_0010;
        DEFAULT_CASE_INSENSITIVE = 0x0000_0020;
    }
}

flag_set! {
    OpenFlags {
        /// Verify the integrity table while opening.
        CHECK_INTEGRITY = 0x0000_0001;
        /// Refuse to open one part of a split archive.
        ERROR_IF_SPLIT = 0x0000_0002;
        WRITE_ACCESS = 0x0000_0004;
    }
}

flag_set! {
    WriteFlags {
        CHECK_INTEGRITY = 0x0000_0001;
        NO_CHECK_INTEGRITY = 0x0000_0002;
        PIPABLE = 0x0000_0004;
        NOT_PIPABLE = 0x0000_0008;
        RECOMPRESS = 0x0000_0010;
        FSYNC = 0x0000_0020;
        REBUILD = 0x0000_0040;
        SOFT_DELETE = 0x0000_0080;
        IGNORE_READONLY_FLAG = 0x0000_0100;
        /// Leave resources that live in referenced archives out of the output.
        SKIP_EXTERNAL_WIMS = 0x0000_0200;
        STREAMS_OK = 0x0000_0400;
        RETAIN_GUID = 0x0000_0800;
        /// Store resources with the pack ("solid") compression settings.
        SOLID = 0x0000_1000;
        SEND_DONE_WITH_FILE_MESSAGES = 0x0000_2000;
        NO_SOLID_SORT = 0x0000_4000;
        UNSAFE_COMPACT = 0x0000_8000;
    }
}

flag_set! {
    AddFlags {
        NTFS = 0x0000_0001;
        DEREFERENCE = 0x0000_0002;
        VERBOSE = 0x0000_0004;
        /// Mark the new image bootable.
        BOOT = 0x0000_0008;
        UNIX_DATA = 0x0000_0010;
        RPFIX = 0x0000_0020;
        NORPFIX = 0x0000_0040;
        NO_UNSUPPORTED_EXCLUDE = 0x0000_0080;
        WINCONFIG = 0x0000_0100;
        WIMBOOT = 0x0000_0200;
        NO_ACLS = 0x0000_0400;
        STRICT_ACLS = 0x0000_0800;
        EXCLUDE_VERBOSE = 0x0000_1000;
        TEST_FILE_EXCLUSION = 0x0000_2000;
        SNAPSHOT = 0x0000_4000;
        FILE_PATHS_UNNEEDED = 0x0000_8000;
    }
}

flag_set! {
    ExportFlags {
        BOOT = 0x0000_0001;
        NO_NAMES = 0x0000_0002;
        NO_DESCRIPTIONS = 0x0000_0004;
        GIFT = 0x0000_0008;
        WIMBOOT = 0x0000_0010;
    }
}

flag_set! {
    ExtractFlags {
        NTFS = 0x0000_0001;
        RECOVER_DATA = 0x0000_0002;
        UNIX_DATA = 0x0000_0020;
        NO_ACLS = 0x0000_0040;
        STRICT_ACLS = 0x0000_0080;
        RPFIX = 0x0000_0100;
        NORPFIX = 0x0000_0200;
        TO_STDOUT = 0x0000_0400;
        REPLACE_INVALID_FILENAMES = 0x0000_0800;
        ALL_CASE_CONFLICTS = 0x0000_1000;
        STRICT_TIMESTAMPS = 0x0000_2000;
        STRICT_SHORT_NAMES = 0x0000_4000;
        STRICT_SYMLINKS = 0x0000_8000;
        GLOB_PATHS = 0x0004_0000;
        STRICT_GLOB = 0x0008_0000;
        NO_ATTRIBUTES = 0x0010_0000;
        NO_PRESERVE_DIR_STRUCTURE = 0x0020_0000;
        WIMBOOT = 0x0040_0000;
    }
}

flag_set! {
    RefFlags {
        /// Treat file references as glob patterns.
        GLOB_ENABLE = 0x0000_0001;
        /// Fail when a glob matches nothing.
        GLOB_ERR_ON_NOMATCH = 0x0000_0002;
    }
}

flag_set! {
    /// Reserved by the engine; only `NONE` is defined.
    VerifyFlags {}
}

flag_set! {
    /// Reserved by the engine; only `NONE` is defined.
    IterateFlags {}
}

flag_set! {
    /// Which header fields a committed info snapshot changes.
    InfoChanges {
        READONLY_FLAG = 0x0000_0001;
        GUID = 0x0000_0002;
        BOOT_INDEX = 0x0000_0004;
        RPFIX_FLAG = 0x0000_0008;
    }
}
