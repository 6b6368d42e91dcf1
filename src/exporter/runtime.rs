//! Runtime-bound export
//!
//! The synchronous span processor drives exports from its own thread with
//! a plain executor, while HTTP and gRPC clients need the Tokio reactor.
//! `RuntimeExporter` spawns every export future onto the runtime it was
//! created on and hands back the join handle, which any executor can poll.
//!
//! A flush blocks the calling thread until the export finishes, so the
//! runtime needs a worker besides the caller. Handles of a current-thread
//! runtime are rejected.

use futures::future::BoxFuture;
use opentelemetry::trace::TraceError;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use tokio::runtime::{Handle, RuntimeFlavor};

use super::ExporterError;

#[derive(Debug)]
pub struct RuntimeExporter<E> {
    inner: E,
    handle: Handle,
}

impl<E: SpanExporter> RuntimeExporter<E> {
    /// Bind `inner` to the Tokio runtime of the calling thread
    pub fn current(inner: E) -> Result<Self, ExporterError> {
        Self::new(inner, current_handle()?)
    }

    pub fn new(inner: E, handle: Handle) -> Result<Self, ExporterError> {
        check_flavor(&handle)?;
        Ok(Self { inner, handle })
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: SpanExporter> SpanExporter for RuntimeExporter<E> {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let export = self.handle.spawn(self.inner.export(batch));
        Box::pin(async move {
            match export.await {
                Ok(result) => result,
                Err(e) => Err(TraceError::Other(Box::new(e))),
            }
        })
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

/// Handle of the calling thread's runtime, if exports can block on it
pub(crate) fn current_handle() -> Result<Handle, ExporterError> {
    let handle = Handle::try_current().map_err(|_| ExporterError::NoRuntime)?;
    check_flavor(&handle)?;
    Ok(handle)
}

fn check_flavor(handle: &Handle) -> Result<(), ExporterError> {
    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
        return Err(ExporterError::CurrentThreadRuntime);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct NeedsReactor {
        calls: Arc<AtomicUsize>,
    }

    impl SpanExporter for NeedsReactor {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            let calls = self.calls.clone();
            Box::pin(async move {
                // Panics outside a Tokio runtime
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn test_current_requires_runtime() {
        let result = RuntimeExporter::current(NeedsReactor::default());
        assert!(matches!(result, Err(ExporterError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_current_thread_runtime_is_rejected() {
        let result = RuntimeExporter::current(NeedsReactor::default());
        assert!(matches!(result, Err(ExporterError::CurrentThreadRuntime)));
    }

    #[test]
    fn test_new_rejects_current_thread_handle() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = RuntimeExporter::new(NeedsReactor::default(), runtime.handle().clone());
        assert!(matches!(result, Err(ExporterError::CurrentThreadRuntime)));
    }

    #[test]
    fn test_export_from_foreign_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut exporter = RuntimeExporter::new(
            NeedsReactor {
                calls: calls.clone(),
            },
            runtime.handle().clone(),
        )
        .unwrap();

        let result = std::thread::spawn(move || {
            futures::executor::block_on(exporter.export(Vec::new()))
        })
        .join()
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
