use std::collections::HashSet;

use bytemuck::Zeroable;
use strum::IntoEnumIterator;
use tracing::info;
use trace_store_ipc::{
    InstanceInfo, InstanceSnapshot, ObjectNames, Version,
    instance::{VERSION_MINOR, VERSION_PROTOCOL},
};

use crate::{error::LaunchError, exit_code::ExitCode};

fn check(ok: bool, message: &str) -> Result<(), LaunchError> {
    if ok {
        Ok(())
    } else {
        Err(LaunchError::SelfCheck {
            message: message.to_owned(),
        })
    }
}

/// The hidden `test` verb: sanity checks on what this build would put into
/// shared memory and hand back as exit codes.
pub fn run(namespace: &str) -> Result<(), LaunchError> {
    let version = Version::CURRENT;
    check(
        version.protocol() == VERSION_PROTOCOL
            && version.minor() == VERSION_MINOR,
        "current version does not round-trip its components",
    )?;
    check(
        version.is_debug() == cfg!(debug_assertions),
        "debug flag does not match the build",
    )?;

    check(
        InstanceInfo::SIZE == size_of::<InstanceSnapshot>()
            && InstanceInfo::SIZE <= 4096,
        "instance record does not fit its segment",
    )?;
    let fresh = InstanceInfo::zeroed();
    check(
        !fresh.is_published()
            && bytemuck::bytes_of(&fresh.snapshot()).iter().all(|b| *b == 0),
        "fresh instance record is not all zeroes",
    )?;

    let names = ObjectNames::new(namespace);
    let distinct: HashSet<_> =
        [&names.segment, &names.quit, &names.begun].into_iter().collect();
    check(distinct.len() == 3, "object names collide")?;

    for (i, code) in ExitCode::iter().enumerate() {
        check(
            usize::from(u8::from(code)) == i,
            "exit codes are not numbered in order",
        )?;
    }

    info!("self check passed for {version} in namespace {namespace}");
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn passes_on_this_build() {
        super::run("SelfCheck").unwrap();
    }
}
