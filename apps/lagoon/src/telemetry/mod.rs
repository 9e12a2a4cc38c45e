fn env_flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
}

/// Subscriber setup for the `lagoon` binary.
///
/// Verbosity is raised per call-client area (`lagoon::session`,
/// `lagoon::signaling`, `lagoon::engine`, `lagoon::room`) while everything
/// else stays at `info`. The ICE/DTLS stacks under webrtc are chatty even
/// there, so they are held at `warn` unless `LAGOON_TRACE_DEPS` is set.
/// `LAGOON_LOG_FILTER` replaces the computed directives outright.
pub mod logging {
    use std::fs::{File, OpenOptions};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    const AREAS: &[&str] = &[
        "lagoon::session",
        "lagoon::signaling",
        "lagoon::engine",
        "lagoon::room",
    ];

    const CHATTY_DEPS: &[&str] = &[
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_sctp",
        "webrtc_mdns",
        "tungstenite",
        "tokio_tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn area_level(self) -> Option<&'static str> {
            match self {
                LogLevel::Debug => Some("debug"),
                LogLevel::Trace => Some("trace"),
                _ => None,
            }
        }

        /// Filter directives for this level. `with_deps` lets dependency
        /// traces through at trace level.
        pub fn directives(self, with_deps: bool) -> String {
            let Some(area_level) = self.area_level() else {
                return match self {
                    LogLevel::Error => "error",
                    LogLevel::Warn => "warn",
                    _ => "info",
                }
                .to_owned();
            };
            if self == LogLevel::Trace && with_deps {
                return "trace".to_owned();
            }
            let mut directives = vec!["info".to_owned()];
            directives.extend(AREAS.iter().map(|area| format!("{area}={area_level}")));
            directives.extend(CHATTY_DEPS.iter().map(|dep| format!("{dep}=warn")));
            directives.join(",")
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Log file, appended to. Logs go to stderr when unset.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid LAGOON_LOG_FILTER `{filter}`: {reason}")]
        Filter { filter: String, reason: String },
        #[error("failed to install subscriber: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = match std::env::var("LAGOON_LOG_FILTER") {
            Ok(custom) => custom_filter(&custom)?,
            Err(_) => EnvFilter::new(config.level.directives(super::env_flag("LAGOON_TRACE_DEPS"))),
        };
        let (writer, guard) = match &config.file {
            Some(path) => tracing_appender::non_blocking(open_log_file(path)?),
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level.area_level().is_some())
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn custom_filter(filter: &str) -> Result<EnvFilter, InitError> {
        EnvFilter::try_new(filter).map_err(|err| InitError::Filter {
            filter: filter.to_owned(),
            reason: err.to_string(),
        })
    }

    fn open_log_file(path: &Path) -> Result<File, InitError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn quiet_levels_apply_globally() {
            assert_eq!(LogLevel::Warn.directives(false), "warn");
            assert_eq!(LogLevel::Error.directives(true), "error");
            assert_eq!(LogLevel::Info.directives(false), "info");
        }

        #[test]
        fn debug_raises_call_areas_and_quiets_ice() {
            let directives = LogLevel::Debug.directives(false);
            assert!(directives.starts_with("info,"));
            assert!(directives.contains("lagoon::session=debug"));
            assert!(directives.contains("lagoon::signaling=debug"));
            assert!(directives.contains("lagoon::engine=debug"));
            assert!(directives.contains("webrtc_ice=warn"));
            assert_eq!(LogLevel::Debug.directives(true), directives);
        }

        #[test]
        fn trace_opens_dependencies_only_on_request() {
            assert!(LogLevel::Trace.directives(false).contains("lagoon::room=trace"));
            assert!(LogLevel::Trace.directives(false).contains("webrtc_dtls=warn"));
            assert_eq!(LogLevel::Trace.directives(true), "trace");
        }

        #[test]
        fn computed_directives_parse() {
            for level in LogLevel::value_variants() {
                assert!(custom_filter(&level.directives(false)).is_ok());
            }
        }

        #[test]
        fn bad_custom_filter_is_reported() {
            let err = custom_filter("lagoon=loudest").expect_err("invalid level");
            assert!(matches!(err, InitError::Filter { .. }));
        }

        #[test]
        fn missing_log_directory_is_reported() {
            let path = std::env::temp_dir()
                .join("lagoon-no-such-dir")
                .join("lagoon.log");
            assert!(matches!(open_log_file(&path), Err(InitError::Io { .. })));
        }
    }
}
