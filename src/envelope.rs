//! Envelope extraction from a raw queued message.
//!
//! The collector stores the message exactly as received, so the routing
//! information is recovered from the `From` and `To` header fields.

use failure::Fail;
use lettre::EmailAddress;
use mailparse::{MailAddr, MailHeaderMap};

/// Sender and recipients governing SMTP routing for one message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: String,

    /// In header order, duplicates removed
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Fail)]
pub enum EnvelopeError {
    #[fail(display = "malformed header block: {}", _0)]
    MalformedHeaders(String),

    #[fail(display = "missing From header")]
    MissingFrom,

    #[fail(display = "invalid From address: {}", _0)]
    InvalidFrom(String),

    #[fail(display = "missing To header")]
    MissingTo,

    #[fail(display = "invalid To address list: {}", _0)]
    InvalidTo(String),

    #[fail(display = "empty sender address")]
    EmptySender,

    #[fail(display = "no recipients")]
    NoRecipients,

    #[fail(display = "invalid recipient address: {}", _0)]
    InvalidRecipient(String),
}

/// Pull the envelope out of a raw message (header block followed by body).
pub fn extract(message: &[u8]) -> Result<Envelope, EnvelopeError> {
    let (headers, _body_offset) = mailparse::parse_headers(message)
        .map_err(|e| EnvelopeError::MalformedHeaders(e.to_string()))?;

    let from = headers
        .get_first_value("From")
        .ok_or(EnvelopeError::MissingFrom)?;
    let sender = single_address(&from)?;
    if sender.is_empty() {
        return Err(EnvelopeError::EmptySender);
    }
    if !is_deliverable(&sender) {
        return Err(EnvelopeError::InvalidFrom(sender));
    }

    let to = headers
        .get_first_value("To")
        .ok_or(EnvelopeError::MissingTo)?;
    let list = mailparse::addrparse(&to).map_err(|e| EnvelopeError::InvalidTo(e.to_string()))?;

    let mut recipients: Vec<String> = Vec::new();
    for addr in list.iter() {
        let addrs: Vec<&str> = match addr {
            MailAddr::Single(single) => vec![&*single.addr],
            MailAddr::Group(group) => group.addrs.iter().map(|s| &*s.addr).collect(),
        };
        for raw in addrs {
            let rcpt = clean_address(raw);
            if rcpt.is_empty() {
                continue;
            }
            if !is_deliverable(&rcpt) {
                return Err(EnvelopeError::InvalidRecipient(rcpt));
            }
            if !recipients.iter().any(|r| same_mailbox(r, &rcpt)) {
                recipients.push(rcpt);
            }
        }
    }

    if recipients.is_empty() {
        return Err(EnvelopeError::NoRecipients);
    }

    Ok(Envelope { sender, recipients })
}

fn single_address(value: &str) -> Result<String, EnvelopeError> {
    let list =
        mailparse::addrparse(value).map_err(|e| EnvelopeError::InvalidFrom(e.to_string()))?;
    if list.is_empty() {
        return Err(EnvelopeError::EmptySender);
    }
    match list.extract_single_info() {
        Some(info) => Ok(clean_address(&info.addr)),
        None => Err(EnvelopeError::InvalidFrom(format!(
            "expected a single mailbox in {:?}",
            value.trim()
        ))),
    }
}

// The SMTP client refuses what lettre won't take (quoted local parts among
// others), so such a message can never go out and is caught here instead.
fn is_deliverable(addr: &str) -> bool {
    split_address(addr).is_some() && EmailAddress::new(addr.to_owned()).is_ok()
}

/// Local parts compare exactly, domains without regard to case.
fn same_mailbox(a: &str, b: &str) -> bool {
    match (split_address(a), split_address(b)) {
        (Some((a_local, a_domain)), Some((b_local, b_domain))) => {
            a_local == b_local && a_domain.eq_ignore_ascii_case(b_domain)
        }
        _ => a == b,
    }
}

/// Strip surrounding whitespace and angle brackets
pub fn clean_address(addr: &str) -> String {
    addr.trim_matches(|c: char| c == '<' || c == '>' || c.is_whitespace())
        .to_owned()
}

/// Split an address into local part and domain at the last `@`.  Returns
/// `None` unless both halves are non-empty and free of whitespace.
pub fn split_address(addr: &str) -> Option<(&str, &str)> {
    let at = addr.rfind('@')?;
    let (local, domain) = (&addr[..at], &addr[at + 1..]);
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    if addr.chars().any(char::is_whitespace) {
        return None;
    }
    Some((local, domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sender_and_recipients() {
        let msg = b"From: a@x.test\r\nTo: b@y.test, c@z.test\r\nSubject: hi\r\n\r\nbody\r\n";
        let envelope = extract(msg).unwrap();
        assert_eq!(envelope.sender, "a@x.test");
        assert_eq!(envelope.recipients, vec!["b@y.test", "c@z.test"]);
    }

    #[test]
    fn display_names_and_brackets_are_stripped() {
        let msg = b"From: Alice <alice@x.test>\r\n\
                    To: \"Bob B\" <bob@y.test>,\r\n <carol@z.test>\r\n\r\nbody";
        let envelope = extract(msg).unwrap();
        assert_eq!(envelope.sender, "alice@x.test");
        assert_eq!(envelope.recipients, vec!["bob@y.test", "carol@z.test"]);
    }

    #[test]
    fn groups_are_flattened() {
        let msg = b"From: a@x.test\r\nTo: team: b@y.test, c@z.test;\r\n\r\n";
        let envelope = extract(msg).unwrap();
        assert_eq!(envelope.recipients, vec!["b@y.test", "c@z.test"]);
    }

    #[test]
    fn duplicate_recipients_are_dropped() {
        let msg = b"From: a@x.test\r\nTo: b@y.test, c@z.test, b@Y.TEST\r\n\r\n";
        let envelope = extract(msg).unwrap();
        assert_eq!(envelope.recipients, vec!["b@y.test", "c@z.test"]);
    }

    #[test]
    fn local_part_case_is_significant() {
        let msg = b"From: a@x.test\r\nTo: b@y.test, B@y.test\r\n\r\n";
        let envelope = extract(msg).unwrap();
        assert_eq!(envelope.recipients, vec!["b@y.test", "B@y.test"]);
    }

    #[test]
    fn quoted_local_part_is_rejected() {
        let msg = b"From: a@x.test\r\nTo: b@y.test, \"odd@local\"@y.test\r\n\r\n";
        match extract(msg) {
            Err(EnvelopeError::InvalidRecipient(_)) | Err(EnvelopeError::InvalidTo(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        let msg = b"From: \"odd sender\"@x.test\r\nTo: b@y.test\r\n\r\n";
        assert!(extract(msg).is_err());
    }

    #[test]
    fn missing_to_is_not_deliverable() {
        let msg = b"From: a@x.test\r\nSubject: no rcpt\r\n\r\nbody";
        assert_eq!(extract(msg), Err(EnvelopeError::MissingTo));
    }

    #[test]
    fn missing_from_is_not_deliverable() {
        let msg = b"To: b@y.test\r\n\r\nbody";
        assert_eq!(extract(msg), Err(EnvelopeError::MissingFrom));
    }

    #[test]
    fn multiple_senders_are_rejected() {
        let msg = b"From: a@x.test, d@x.test\r\nTo: b@y.test\r\n\r\n";
        match extract(msg) {
            Err(EnvelopeError::InvalidFrom(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn recipient_without_domain_is_rejected() {
        let msg = b"From: a@x.test\r\nTo: b@y.test, nobody\r\n\r\n";
        match extract(msg) {
            Err(EnvelopeError::InvalidRecipient(_)) | Err(EnvelopeError::InvalidTo(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_group_has_no_recipients() {
        let msg = b"From: a@x.test\r\nTo: undisclosed-recipients:;\r\n\r\n";
        assert_eq!(extract(msg), Err(EnvelopeError::NoRecipients));
    }

    #[test]
    fn address_splitting() {
        assert_eq!(split_address("b@y.test"), Some(("b", "y.test")));
        assert_eq!(split_address("\"odd@local\"@y.test"), Some(("\"odd@local\"", "y.test")));
        assert_eq!(split_address("b@"), None);
        assert_eq!(split_address("@y.test"), None);
        assert_eq!(split_address("nobody"), None);
        assert_eq!(clean_address("  <b@y.test> "), "b@y.test");
    }
}
