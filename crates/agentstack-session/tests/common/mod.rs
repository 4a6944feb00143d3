use agentstack_session::ProgressSink;

/// One sink call, in order of arrival
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Notify(usize, String),
    Respond(usize, String),
    Partial(usize, String),
    Status(String),
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<Recorded>,
}

impl RecordingSink {
    pub fn statuses(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Recorded::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<(usize, &str)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Recorded::Notify(slot, m) => Some((*slot, m.as_str())),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn notify(&mut self, slot: usize, message: &str) {
        self.calls.push(Recorded::Notify(slot, message.to_string()));
    }

    fn respond(&mut self, slot: usize, message: &str) {
        self.calls.push(Recorded::Respond(slot, message.to_string()));
    }

    fn partial(&mut self, slot: usize, text: &str) {
        self.calls.push(Recorded::Partial(slot, text.to_string()));
    }

    fn status(&mut self, status: &str) {
        self.calls.push(Recorded::Status(status.to_string()));
    }
}
