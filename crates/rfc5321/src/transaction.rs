/// Verbs that may legitimately occur more than once in a session and
/// are therefore recorded every time. Everything else is recorded only
/// on first occurrence.
const REPEATABLE: &[&str] = &["SMTP", "RCPT", "BDAT"];

/// An immutable record of one SMTP exchange: what was sent, what came
/// back, and whether the reply was an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    command: String,
    payload: Option<String>,
    response: String,
    error: bool,
    address: Option<String>,
}

impl Transaction {
    pub fn new<C: Into<String>>(command: C) -> Self {
        Self {
            command: command.into(),
            payload: None,
            response: String::new(),
            error: false,
            address: None,
        }
    }

    pub fn with_payload<P: Into<String>>(mut self, payload: P) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Record the reply line. The error flag is derived from the reply
    /// code: anything in the 4xx/5xx range is an error.
    pub fn with_response<R: Into<String>>(mut self, response: R) -> Self {
        self.response = response.into();
        self.error = matches!(self.response.as_bytes().first(), Some(b'4') | Some(b'5'));
        self
    }

    /// Override the derived error flag. Scenario-injected rejections use
    /// this to record an error reply without counting as a client error.
    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    /// The normalized mailbox of an RCPT exchange
    pub fn with_address<A: Into<String>>(mut self, address: A) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

/// Append-only, wire-ordered record of the exchanges in one session.
/// Duplicate entries for non-repeatable verbs are silently dropped so
/// that assertions always see the first exchange for each verb.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    transactions: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transaction: Transaction) {
        let repeatable = REPEATABLE
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&transaction.command));
        if !repeatable
            && self
                .transactions
                .iter()
                .any(|t| t.command.eq_ignore_ascii_case(&transaction.command))
        {
            return;
        }
        tracing::trace!(
            "transaction: {} -> {}",
            transaction.command,
            transaction.response.trim_end()
        );
        self.transactions.push(transaction);
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transactions_for(&self, command: &str) -> Vec<&Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.command.eq_ignore_ascii_case(command))
            .collect()
    }

    pub fn errors(&self) -> Vec<&Transaction> {
        self.transactions.iter().filter(|t| t.error).collect()
    }

    pub fn has_data_error(&self) -> bool {
        self.transactions
            .iter()
            .any(|t| t.error && t.command.eq_ignore_ascii_case("DATA"))
    }

    pub fn failed_recipients(&self) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|t| t.error && t.command.eq_ignore_ascii_case("RCPT"))
            .filter_map(|t| t.address.clone())
            .collect()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|t| t.command.eq_ignore_ascii_case("RCPT"))
            .filter_map(|t| t.address.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn duplicate_suppression() {
        let mut log = TransactionLog::new();
        log.add(Transaction::new("EHLO").with_response("250 hello"));
        log.add(Transaction::new("EHLO").with_response("250 hello again"));
        assert_equal!(log.len(), 1);
        assert_equal!(log.transactions()[0].response(), "250 hello");
    }

    #[test]
    fn repeatable_verbs_accumulate() {
        let mut log = TransactionLog::new();
        log.add(
            Transaction::new("RCPT")
                .with_response("250 ok")
                .with_address("a@b"),
        );
        log.add(
            Transaction::new("RCPT")
                .with_response("550 no")
                .with_address("c@d"),
        );
        log.add(Transaction::new("BDAT").with_response("250 ok"));
        log.add(Transaction::new("BDAT").with_response("250 ok"));
        assert_equal!(log.transactions_for("rcpt").len(), 2);
        assert_equal!(log.transactions_for("BDAT").len(), 2);
    }

    #[test]
    fn error_derived_from_code() {
        let txn = Transaction::new("MAIL").with_response("550 5.1.0 rejected");
        assert!(txn.is_error());
        let txn = Transaction::new("MAIL").with_response("250 2.1.0 ok");
        assert!(!txn.is_error());
    }

    #[test]
    fn recipient_queries() {
        let mut log = TransactionLog::new();
        log.add(
            Transaction::new("RCPT")
                .with_response("250 ok")
                .with_address("a@b"),
        );
        log.add(
            Transaction::new("RCPT")
                .with_response("550 blocked")
                .with_address("c@d"),
        );
        assert_equal!(log.recipients(), vec!["a@b".to_string(), "c@d".to_string()]);
        assert_equal!(log.failed_recipients(), vec!["c@d".to_string()]);
    }

    #[test]
    fn data_error() {
        let mut log = TransactionLog::new();
        log.add(Transaction::new("DATA").with_response("554 5.6.0 content rejected"));
        assert!(log.has_data_error());
        log.clear();
        assert!(log.is_empty());
        assert!(!log.has_data_error());
    }

    #[test]
    fn wire_order_preserved() {
        let mut log = TransactionLog::new();
        for verb in ["SMTP", "EHLO", "MAIL", "RCPT", "DATA", "QUIT"] {
            log.add(Transaction::new(verb).with_response("250 ok"));
        }
        let verbs: Vec<&str> = log.transactions().iter().map(|t| t.command()).collect();
        assert_equal!(verbs, vec!["SMTP", "EHLO", "MAIL", "RCPT", "DATA", "QUIT"]);
    }
}
