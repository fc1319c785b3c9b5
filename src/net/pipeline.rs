//! Per-connection processing stages.
//!
//! A pipeline is an ordered list of byte transforms. Inbound chunks flow
//! through the stages first to last; outbound chunks flow last to first.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::net::connection::ConnectionInfo;

/// A byte transform installed on a connection.
pub trait Stage: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn inbound(&self, chunk: Bytes) -> Bytes {
        chunk
    }

    fn outbound(&self, chunk: Bytes) -> Bytes {
        chunk
    }
}

/// Immutable, cheaply clonable stage list.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Apply inbound transforms in order.
    pub fn inbound(&self, chunk: Bytes) -> Bytes {
        self.stages.iter().fold(chunk, |acc, stage| stage.inbound(acc))
    }

    /// Apply outbound transforms in reverse order.
    pub fn outbound(&self, chunk: Bytes) -> Bytes {
        self.stages
            .iter()
            .rev()
            .fold(chunk, |acc, stage| stage.outbound(acc))
    }
}

/// Mutable stage list handed to the connection-setup callback.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    /// Append a stage after the existing ones.
    pub fn add_last(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Insert a stage before the existing ones.
    pub fn add_first(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.insert(0, Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages.into(),
        }
    }
}

type SetupFn = dyn Fn(&ConnectionInfo, &mut PipelineBuilder) + Send + Sync;

/// Callback run once per new connection, before any data flows.
#[derive(Clone)]
pub struct ConnectionSetup(Arc<SetupFn>);

impl ConnectionSetup {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ConnectionInfo, &mut PipelineBuilder) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, info: &ConnectionInfo, builder: &mut PipelineBuilder) {
        (self.0)(info, builder)
    }
}

impl fmt::Debug for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionSetup(..)")
    }
}

/// Logs every chunk crossing the connection at TRACE level.
#[derive(Debug, Clone)]
pub struct WireLog {
    connection: String,
}

impl WireLog {
    const PREVIEW: usize = 64;

    pub fn new(info: &ConnectionInfo) -> Self {
        Self {
            connection: info.id.to_string(),
        }
    }

    fn log(&self, direction: &'static str, chunk: &Bytes) {
        let preview = &chunk[..chunk.len().min(Self::PREVIEW)];
        tracing::trace!(
            connection_id = %self.connection,
            direction,
            len = chunk.len(),
            data = %String::from_utf8_lossy(preview),
            "wire"
        );
    }
}

impl Stage for WireLog {
    fn name(&self) -> &str {
        "wire-log"
    }

    fn inbound(&self, chunk: Bytes) -> Bytes {
        self.log("in", &chunk);
        chunk
    }

    fn outbound(&self, chunk: Bytes) -> Bytes {
        self.log("out", &chunk);
        chunk
    }
}

/// Build the pipeline for a freshly opened connection.
pub(crate) fn for_connection(
    wire_logging: bool,
    setup: Option<&ConnectionSetup>,
    info: &ConnectionInfo,
) -> Pipeline {
    let mut builder = Pipeline::builder();
    if wire_logging {
        builder.add_last(WireLog::new(info));
    }
    if let Some(setup) = setup {
        setup.apply(info, &mut builder);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::TransportKind;

    #[derive(Debug)]
    struct Suffix(&'static str);

    impl Stage for Suffix {
        fn name(&self) -> &str {
            self.0
        }

        fn inbound(&self, chunk: Bytes) -> Bytes {
            [chunk.as_ref(), self.0.as_bytes()].concat().into()
        }

        fn outbound(&self, chunk: Bytes) -> Bytes {
            self.inbound(chunk)
        }
    }

    #[test]
    fn inbound_runs_in_order_outbound_in_reverse() {
        let mut builder = Pipeline::builder();
        builder.add_last(Suffix("a")).add_last(Suffix("b"));
        let pipeline = builder.build();

        assert_eq!(pipeline.inbound(Bytes::from_static(b"x")), "xab");
        assert_eq!(pipeline.outbound(Bytes::from_static(b"x")), "xba");
    }

    #[test]
    fn setup_callback_appends_after_wire_log() {
        let info = ConnectionInfo::new(
            TransportKind::Tcp,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        let setup = ConnectionSetup::new(|_, b| {
            b.add_last(Suffix("custom"));
        });

        let pipeline = for_connection(true, Some(&setup), &info);
        assert_eq!(pipeline.names(), vec!["wire-log", "custom"]);

        let plain = for_connection(false, None, &info);
        assert!(plain.is_empty());
    }
}
