//! Queue dispatcher for a store-and-forward mail relay.
//!
//! An inbound collector writes every accepted message into a queue directory
//! as `mail-<nanoseconds>.eml`.  A [`Dispatcher`] run takes a snapshot of that
//! directory, hands the files to a fixed pool of worker threads and, per file:
//!
//! * extracts the envelope from the `From` and `To` headers,
//! * resolves the mail exchanger of each recipient's domain,
//! * relays the message over SMTP, one connection per recipient,
//! * removes the file once every recipient accepted it.
//!
//! Any failure leaves the file where it is; running the dispatcher again is
//! the retry mechanism.  A message that reached some recipients before
//! failing on another is sent again, in full, on the next run.
//!
//! ```no_run
//! use mailrelay::{Config, Dispatcher};
//!
//! let config = Config::from_file("/etc/mailrelay.toml").unwrap();
//! let dispatcher = Dispatcher::from_config(config).unwrap();
//! let report = dispatcher.run().unwrap();
//! println!("{} delivered, {} retained", report.delivered.len(), report.retained.len());
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;


pub mod config;
pub mod delivery_result;
pub mod envelope;
pub mod error;
pub mod queue;
mod worker;

pub use crate::config::{Config, ResolverSetup};
pub use crate::delivery_result::{FileState, MessageOutcome};
pub use crate::envelope::{Envelope, EnvelopeError};
pub use crate::error::Error;
pub use crate::queue::{FilePattern, QueueFile};
pub use crate::worker::mx::{DnsResolver, Exchanger, ExchangerResolver, ResolveError};
pub use crate::worker::smtp::{
    DeliveryAttempt, DeliveryError, FailureClass, SmtpTransport, Stage, Transport,
};
pub use crate::worker::{Dispatcher, RunReport, Shutdown};
