use std::io;

use failure::Fail;

/// Errors which end a dispatcher run.  Anything scoped to a single queue file
/// is reported through `MessageOutcome` instead and never shows up here.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "cannot read queue directory {}: {}", path, cause)]
    QueueDirectory {
        path: String,
        #[cause]
        cause: io::Error,
    },

    #[fail(display = "cannot read configuration file {}: {}", path, cause)]
    ConfigRead {
        path: String,
        #[cause]
        cause: io::Error,
    },

    #[fail(display = "cannot parse configuration: {}", _0)]
    ConfigParse(#[cause] toml::de::Error),

    #[fail(display = "invalid configuration: {}", _0)]
    InvalidConfig(String),

    #[fail(display = "failed to create DNS resolver: {}", _0)]
    ResolverCreation(#[cause] io::Error),

    #[fail(display = "failed to start worker thread: {}", _0)]
    WorkerSpawn(#[cause] io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Error {
        Error::ConfigParse(e)
    }
}
