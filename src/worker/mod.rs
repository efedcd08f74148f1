pub mod mx;
pub mod smtp;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use uuid::Uuid;

use self::mx::{DnsResolver, ExchangerResolver, ResolveError};
use self::smtp::{DeliveryAttempt, FailureClass, SmtpTransport, Stage, Transport};
use crate::config::Config;
use crate::delivery_result::{FileState, MessageOutcome};
use crate::envelope::{self, Envelope, EnvelopeError};
use crate::error::Error;
use crate::queue::{self, FilePattern, QueueFile};

/// Cancellation token shared by the dispatcher, its workers and every
/// delivery attempt.  Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown(Arc::new(AtomicBool::new(false)))
    }

    /// Ask the run to stop.  Workers finish at the next file or protocol
    /// step boundary; unfinished files stay queued.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a run did to the queue
#[derive(Debug, Default)]
pub struct RunReport {
    pub run_id: String,

    /// Files delivered to every recipient (and removed)
    pub delivered: Vec<PathBuf>,

    /// Files left in the queue, with the reason
    pub retained: Vec<(PathBuf, MessageOutcome)>,

    /// Files never picked up because of a shutdown request
    pub skipped: usize,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.delivered.len() + self.retained.len() + self.skipped
    }

    pub fn all_delivered(&self) -> bool {
        self.retained.is_empty() && self.skipped == 0
    }
}

/// Drains one snapshot of the queue directory with a fixed pool of workers.
///
/// Each queued file is handed to exactly one worker.  A file is removed only
/// after every one of its recipients accepted the message; anything else
/// leaves it in place for the next run, which is the only retry mechanism.
///
/// Two dispatchers must not run against the same queue directory at once:
/// nothing claims a file, so both would deliver it.
pub struct Dispatcher {
    config: Config,
    pattern: FilePattern,
    resolver: Arc<dyn ExchangerResolver>,
    transport: Arc<dyn Transport>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        resolver: Arc<dyn ExchangerResolver>,
        transport: Arc<dyn Transport>,
    ) -> Result<Dispatcher, Error> {
        config.validate()?;
        let pattern = FilePattern::new(&*config.file_prefix, &*config.file_suffix);
        Ok(Dispatcher {
            config,
            pattern,
            resolver,
            transport,
            shutdown: Shutdown::new(),
        })
    }

    /// Build a dispatcher that resolves through DNS and delivers over SMTP
    pub fn from_config(config: Config) -> Result<Dispatcher, Error> {
        config.validate()?;
        let resolver = DnsResolver::new(&config.resolver_setup, config.dns_timeout())?;
        let transport = SmtpTransport::new(config.connect_timeout(), config.smtp_timeout());
        Dispatcher::new(config, Arc::new(resolver), Arc::new(transport))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Process every file present in the queue directory right now, then
    /// return.  Only an unreadable queue directory (or failing to start the
    /// workers) is an error; per-file failures are in the report.
    pub fn run(&self) -> Result<RunReport, Error> {
        let run_id = Uuid::new_v4().hyphenated().to_string();
        let files = queue::scan(&self.config.queue_dir, &self.pattern)?;
        let total = files.len();

        info!(
            "(dispatcher) run {} starting: {} queued file(s) in {}, {} worker(s)",
            run_id,
            total,
            self.config.queue_dir.display(),
            self.config.worker_count
        );

        // Fill the work channel once and close it; workers stop when it drains
        let (sender, receiver) = mpsc::channel();
        for file in files {
            // The receiver is alive until the end of this function
            let _ = sender.send(file);
        }
        drop(sender);
        let receiver = Mutex::new(receiver);

        let mut report = RunReport {
            run_id,
            ..Default::default()
        };

        let spawned: Result<(), Error> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.config.worker_count);
            let mut spawn_error = None;
            for worker_id in 0..self.config.worker_count {
                let receiver = &receiver;
                let spawned = thread::Builder::new()
                    .name(format!("mailrelay-worker-{}", worker_id))
                    .spawn_scoped(scope, move || self.work(worker_id, receiver));
                match spawned {
                    Ok(handle) => handles.push((worker_id, handle)),
                    Err(e) => {
                        error!("(dispatcher) failed to start worker {}: {}", worker_id, e);
                        spawn_error = Some(e);
                        break;
                    }
                }
            }

            let started = handles.len();
            for (worker_id, handle) in handles {
                match handle.join() {
                    Ok(results) => {
                        for (file, outcome) in results {
                            if outcome.succeeded() {
                                report.delivered.push(file.path);
                            } else {
                                report.retained.push((file.path, outcome));
                            }
                        }
                    }
                    Err(_) => error!("(worker {}) panicked", worker_id),
                }
            }

            match spawn_error {
                Some(e) if started == 0 => Err(Error::WorkerSpawn(e)),
                Some(e) => {
                    warn!(
                        "(dispatcher) ran with {} of {} workers: {}",
                        started, self.config.worker_count, e
                    );
                    Ok(())
                }
                None => Ok(()),
            }
        });

        // Whatever is still in the channel was never taken
        if let Ok(receiver) = receiver.lock() {
            report.skipped = receiver.try_iter().count();
        }

        info!(
            "(dispatcher) run {} finished: {} delivered, {} retained, {} skipped",
            report.run_id,
            report.delivered.len(),
            report.retained.len(),
            report.skipped
        );

        spawned.map(|_| report)
    }

    // Pull files until the channel is drained or a shutdown is requested
    fn work(
        &self,
        worker_id: usize,
        queue: &Mutex<Receiver<QueueFile>>,
    ) -> Vec<(QueueFile, MessageOutcome)> {
        let mut results = Vec::new();
        loop {
            if self.shutdown.is_triggered() {
                debug!("(worker {}) stopping on shutdown request", worker_id);
                break;
            }

            let next = match queue.lock() {
                Ok(guard) => guard.recv(),
                Err(_) => {
                    error!("(worker {}) work queue lock poisoned", worker_id);
                    break;
                }
            };
            let file = match next {
                Ok(file) => file,
                Err(_) => break, // drained
            };

            let outcome = self.process_file(worker_id, &file);
            self.finish(worker_id, &file, &outcome);
            results.push((file, outcome));
        }
        trace!("(worker {}) done", worker_id);
        results
    }

    /// Take one queue file through extraction, resolution and delivery.
    /// Recipients are handled in order and the first failure abandons the
    /// rest of the message.  The file itself is not touched here.
    pub fn process_file(&self, worker_id: usize, file: &QueueFile) -> MessageOutcome {
        trace!("(worker {}) {}: {:?}", worker_id, file.name, FileState::Pending);

        let content = match fs::read(&file.path) {
            Ok(content) => content,
            Err(e) => return MessageOutcome::ReadFailed(e.to_string()),
        };

        trace!("(worker {}) {}: {:?}", worker_id, file.name, FileState::Extracting);
        let envelope = match envelope::extract(&content) {
            Ok(envelope) => envelope,
            Err(e) => return MessageOutcome::ExtractFailed(e),
        };
        debug!(
            "(worker {}) {}: from {} to [{}]",
            worker_id,
            file.name,
            envelope.sender,
            envelope.recipients.join(", ")
        );

        for recipient in &envelope.recipients {
            if self.shutdown.is_triggered() {
                return MessageOutcome::Cancelled;
            }
            if let Err(outcome) = self.deliver_to_recipient(worker_id, &envelope, recipient, &content)
            {
                return outcome;
            }
        }

        MessageOutcome::Delivered {
            recipients: envelope.recipients.len(),
        }
    }

    fn deliver_to_recipient(
        &self,
        worker_id: usize,
        envelope: &Envelope,
        recipient: &str,
        message: &[u8],
    ) -> Result<(), MessageOutcome> {
        let domain = match envelope::split_address(recipient) {
            Some((_, domain)) => domain,
            None => {
                return Err(MessageOutcome::ExtractFailed(
                    EnvelopeError::InvalidRecipient(recipient.to_owned()),
                ))
            }
        };

        trace!("(worker {}) {}: {:?}", worker_id, recipient, FileState::Resolving);
        let resolve_failed = |error| MessageOutcome::ResolveFailed {
            recipient: recipient.to_owned(),
            error,
        };
        let exchangers = self.resolver.resolve(domain).map_err(resolve_failed)?;
        if exchangers.is_empty() {
            return Err(resolve_failed(ResolveError::NoExchangers(domain.to_owned())));
        }

        trace!("(worker {}) {}: {:?}", worker_id, recipient, FileState::Delivering);
        let mut last_failure = None;
        for exchanger in &exchangers {
            let attempt = DeliveryAttempt {
                host: &exchanger.host,
                port: self.config.smtp_port,
                sender: &envelope.sender,
                recipient,
                message,
                helo_name: &self.config.helo_name,
            };

            info!(
                "(worker {}) Connecting to {}:{} to deliver to {}",
                worker_id, exchanger.host, self.config.smtp_port, recipient
            );
            match self.transport.deliver(&attempt, &self.shutdown) {
                Ok(()) => {
                    debug!("(worker {}) {} accepted by {}", worker_id, recipient, exchanger.host);
                    return Ok(());
                }
                Err(ref e) if e.class == FailureClass::Cancelled => {
                    return Err(MessageOutcome::Cancelled);
                }
                // Unreachable exchanger: move on to the next preference
                Err(e) if e.stage == Stage::Connect => {
                    warn!("(worker {}) {} unreachable: {}", worker_id, exchanger.host, e);
                    last_failure = Some((exchanger.host.clone(), e));
                }
                Err(e) => {
                    return Err(MessageOutcome::DeliverFailed {
                        recipient: recipient.to_owned(),
                        host: exchanger.host.clone(),
                        error: e,
                    });
                }
            }
        }

        match last_failure {
            Some((host, error)) => Err(MessageOutcome::DeliverFailed {
                recipient: recipient.to_owned(),
                host,
                error,
            }),
            None => Err(resolve_failed(ResolveError::NoExchangers(domain.to_owned()))),
        }
    }

    // Remove the file after a full delivery; log either way
    fn finish(&self, worker_id: usize, file: &QueueFile, outcome: &MessageOutcome) {
        if outcome.succeeded() {
            match fs::remove_file(&file.path) {
                Ok(()) => info!(
                    "(worker {}) Delivered and removed: {} ({})",
                    worker_id,
                    file.path.display(),
                    outcome
                ),
                // The delivery happened regardless; the next run will send it again
                Err(e) => error!(
                    "(worker {}) Delivered {} but failed to remove it: {}",
                    worker_id,
                    file.path.display(),
                    e
                ),
            }
        } else {
            warn!(
                "(worker {}) Failed to process {} [{:?}]: {}",
                worker_id,
                file.path.display(),
                outcome.state(),
                outcome
            );
        }
    }
}
