/// A message delivered by a queue transport.
///
/// The envelope is immutable once built. The transport owns the underlying
/// delivery until [`QueueTransport::acknowledge`](crate::messaging::QueueTransport::acknowledge)
/// is called with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    label: String,
    body: Vec<u8>,
    queue: String,
    delivery_tag: u64,
    delivery_count: u32,
    resubmit_count: u32,
}

impl Message {
    pub fn new(
        label: impl Into<String>,
        body: impl Into<Vec<u8>>,
        queue: impl Into<String>,
        delivery_tag: u64,
    ) -> Self {
        Self {
            label: label.into(),
            body: body.into(),
            queue: queue.into(),
            delivery_tag,
            delivery_count: 1,
            resubmit_count: 0,
        }
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count.max(1);
        self
    }

    pub fn with_resubmit_count(mut self, resubmit_count: u32) -> Self {
        self.resubmit_count = resubmit_count;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Queue the message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Transport token used to acknowledge this delivery.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// How many times the broker has delivered this message instance, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// How many replacement messages preceded this one.
    pub fn resubmit_count(&self) -> u32 {
        self.resubmit_count
    }
}

/// What a replacement message carries forward from the one it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResubmitPayload {
    /// Only the label. The replacement has an empty body.
    LabelOnly,

    #[default]
    LabelAndBody,
}

impl ResubmitPayload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LabelOnly => "label-only",
            Self::LabelAndBody => "label-and-body",
        }
    }
}

impl std::fmt::Display for ResubmitPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResubmitPayload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "label-only" => Ok(Self::LabelOnly),
            "label-and-body" => Ok(Self::LabelAndBody),
            other => Err(format!(
                "unknown resubmit payload '{}', expected 'label-only' or 'label-and-body'",
                other
            )),
        }
    }
}

/// A new message to be published, built when a failed message is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub label: String,
    pub body: Vec<u8>,
    pub queue: String,
    pub resubmit_count: u32,
}

impl OutgoingMessage {
    /// Builds the replacement for `original`, addressed to the queue it came from.
    pub fn replacing(original: &Message, payload: ResubmitPayload) -> Self {
        let body = match payload {
            ResubmitPayload::LabelOnly => Vec::new(),
            ResubmitPayload::LabelAndBody => original.body().to_vec(),
        };

        Self {
            label: original.label().to_string(),
            body,
            queue: original.queue().to_string(),
            resubmit_count: original.resubmit_count().saturating_add(1),
        }
    }
}
