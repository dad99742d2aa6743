use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum::{Display, EnumCount, EnumIter};

/// Process exit status of every verb. Once a short-lived `fork` or `kill`
/// has exited this is all its caller gets, so each failure point has its own
/// value.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumCount,
    EnumIter,
    IntoPrimitive,
    TryFromPrimitive,
)]
pub enum ExitCode {
    Ok = 0,
    BegunCreateFail = 1,
    BegunExists = 2,
    BegunTimeout = 3,
    CopyFail = 4,
    ForkFail = 5,
    LaunchFail = 6,
    NoQuitEvent = 7,
    ProcessOpenFail = 8,
    QuitExists = 9,
    RenameFail = 10,
    SharedMemFail = 11,
    SharedMemTruncFail = 12,
    UnexpectedError = 13,
}

impl ExitCode {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ExitCode::Ok
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(u8::from(code))
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn codes_are_dense_and_stable() {
        assert_eq!(ExitCode::COUNT, 14);
        for (i, code) in ExitCode::iter().enumerate() {
            assert_eq!(usize::from(u8::from(code)), i);
            assert_eq!(ExitCode::try_from(u8::from(code)).unwrap(), code);
        }
        assert!(ExitCode::try_from(14u8).is_err());
    }

    #[test]
    fn names_match_variants() {
        assert_eq!(ExitCode::BegunTimeout.to_string(), "BegunTimeout");
        assert!(ExitCode::Ok.is_ok());
        assert!(!ExitCode::NoQuitEvent.is_ok());
    }
}
