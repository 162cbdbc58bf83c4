//! Process CPU time accounting for a benchmarked closure
//!
//! Wall-clock time alone can not tell a sleeping thread from a spinning one.
//! [`rusage()`] reports how much user and system CPU time the process spent
//! inside a closure; for a well-behaved sleep benchmark both stay near zero
//! no matter how wide the fan-out is.

use std::{ops::Sub, time::Duration};

/// Reexports
pub use active_platform::rusage;

#[derive(Debug, Clone, Copy)]
pub struct RUsage {
    pub user_time: Duration,
    pub system_time: Duration,
}

impl Sub for RUsage {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            user_time: self.user_time - other.user_time,
            system_time: self.system_time - other.system_time,
        }
    }
}

#[cfg(target_family = "unix")]
pub use unix as active_platform;

#[cfg(target_os = "windows")]
pub use windows as active_platform;

#[cfg(target_family = "unix")]
pub mod unix {
    use super::RUsage;
    use std::{mem::MaybeUninit, time::Duration};

    /// Runs the closure and returns its result together with the user/system
    /// CPU time the process consumed while it ran.
    pub fn rusage<T>(f: impl FnOnce() -> T) -> (T, RUsage) {
        let before = snapshot();
        let result = f();
        let after = snapshot();

        (result, after - before)
    }

    fn snapshot() -> RUsage {
        use libc::{getrusage, rusage, RUSAGE_SELF};

        let mut usage = unsafe { MaybeUninit::<rusage>::zeroed().assume_init() };
        unsafe { getrusage(RUSAGE_SELF, &mut usage as *mut _) };

        usage.into()
    }

    impl From<libc::rusage> for RUsage {
        fn from(usage: libc::rusage) -> Self {
            fn timeval_to_duration(tv: libc::timeval) -> Duration {
                Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
            }

            Self {
                user_time: timeval_to_duration(usage.ru_utime),
                system_time: timeval_to_duration(usage.ru_stime),
            }
        }
    }
}

#[cfg(target_os = "windows")]
pub mod windows {
    use super::*;
    use ::windows::Win32::{
        Foundation::FILETIME,
        System::Threading::{GetCurrentProcess, GetProcessTimes},
    };

    /// Runs the closure and returns its result together with the user/system
    /// CPU time the process consumed while it ran.
    pub fn rusage<T>(f: impl FnOnce() -> T) -> (T, RUsage) {
        let (kernel_before, user_before) = process_times();
        let result = f();
        let (kernel_after, user_after) = process_times();

        let usage = RUsage {
            user_time: filetime_to_duration(user_before, user_after),
            system_time: filetime_to_duration(kernel_before, kernel_after),
        };
        (result, usage)
    }

    fn process_times() -> (FILETIME, FILETIME) {
        let mut dummy = FILETIME::default();
        let mut kernel_time = FILETIME::default();
        let mut user_time = FILETIME::default();
        let self_process = unsafe { GetCurrentProcess() };
        unsafe {
            GetProcessTimes(
                self_process,
                &mut dummy as *mut _,
                &mut dummy as *mut _,
                &mut kernel_time as *mut _,
                &mut user_time as *mut _,
            )
            .unwrap()
        };
        (kernel_time, user_time)
    }

    fn filetime_to_duration(before: FILETIME, after: FILETIME) -> Duration {
        fn as_u64(ft: FILETIME) -> u64 {
            ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64
        }

        // FILETIME is expressed in 100ns time units
        Duration::from_micros((as_u64(after) - as_u64(before)) / 10)
    }
}
