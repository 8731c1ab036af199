use std::fmt::Display;

pub const LOG_TAG: &str = "apk-installer";

/// Install the platform log backend. Safe to call more than once.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag(LOG_TAG),
    );

    #[cfg(not(target_os = "android"))]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    }
}

/// Log the error side of a result at the failure site and hand the result back untouched.
pub trait LogOnError {
    fn log_on_error(self, context: &str) -> Self;
}

impl<T, E: Display> LogOnError for Result<T, E> {
    fn log_on_error(self, context: &str) -> Self {
        if let Err(err) = &self {
            log::error!("{}: {}", context, err);
        }
        self
    }
}
