use roster_core::extract::{EmbeddingExtractor, ExtractError};
use roster_core::Embedding;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: PathBuf,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request a live embedding for the image at `image`.
    pub async fn extract(&self, image: PathBuf) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the extraction engine on a dedicated OS thread.
///
/// Extractors may hold non-`Sync` state (model sessions, child processes) and
/// block for seconds, so they run one request at a time off the async runtime.
pub fn spawn_engine<E>(mut extractor: E) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let started = std::time::Instant::now();
                        let result = extractor.extract(&image);
                        tracing::debug!(
                            image = %image.display(),
                            ok = result.is_ok(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "extract finished"
                        );
                        // Caller may have timed out and dropped the receiver.
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_engine_round_trip() {
        let handle = spawn_engine(|path: &Path| {
            if path.ends_with("nobody.jpg") {
                Err(ExtractError::NoFaceDetected)
            } else {
                Ok(Embedding::new(vec![1.0, 2.0]))
            }
        })
        .unwrap();

        let emb = handle.extract(PathBuf::from("/faces/ada.jpg")).await.unwrap();
        assert_eq!(emb.values, vec![1.0, 2.0]);

        let err = handle
            .extract(PathBuf::from("/faces/nobody.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_handles_share_one_engine() {
        let handle = spawn_engine(|_: &Path| -> Result<Embedding, ExtractError> {
            Ok(Embedding::new(vec![0.5]))
        })
        .unwrap();
        let clones: Vec<_> = (0..8).map(|_| handle.clone()).collect();
        let tasks: Vec<_> = clones
            .into_iter()
            .map(|h| tokio::spawn(async move { h.extract(PathBuf::from("/x.jpg")).await }))
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }
}
