use crate::error::{Error, Result};
use crate::job::codec::{data_uri, Image, ImageEncoder, OutputMode};
use crate::job::pipeline::Pipelines;
use crate::job::request::JobRequest;
use crate::peer::data_channel::{ChannelSink, OutboundMessage};
use crate::session::Termination;
use crate::utils::unix_millis;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    Binary(Bytes),
    DataUri(String),
}

/// One output image of a job, with the job's shared timing
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub id: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub payload: ResultPayload,
}

#[derive(Serialize)]
struct EmbeddedResult<'a> {
    gen_time: i64,
    start: i64,
    end: i64,
    id: &'a Value,
    image: &'a str,
}

impl JobResult {
    pub fn gen_time_ms(&self) -> i64 {
        unix_millis(self.finished_at) - unix_millis(self.started_at)
    }

    pub fn into_message(self) -> Result<OutboundMessage> {
        match &self.payload {
            ResultPayload::Binary(bytes) => Ok(OutboundMessage::Binary(bytes.clone())),
            ResultPayload::DataUri(uri) => {
                let body = EmbeddedResult {
                    gen_time: self.gen_time_ms(),
                    start: unix_millis(self.started_at),
                    end: unix_millis(self.finished_at),
                    id: &self.id,
                    image: uri,
                };
                Ok(OutboundMessage::Text(serde_json::to_string(&body)?))
            }
        }
    }
}

/// Results of one finished inference call. Images are encoded one at a time
/// as they are pulled, so the first can be sent before the rest are encoded.
pub struct JobOutput {
    id: Value,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    images: std::vec::IntoIter<Image>,
    encoder: Arc<dyn ImageEncoder>,
    mode: OutputMode,
}

impl JobOutput {
    /// Images not yet pulled
    pub fn remaining(&self) -> usize {
        self.images.len()
    }

    /// Encodes the next image on a blocking thread.
    pub async fn next_result(&mut self) -> Option<Result<JobResult>> {
        let image = self.images.next()?;
        let encoder = self.encoder.clone();
        let encoded = match tokio::task::spawn_blocking(move || encoder.encode(&image)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Some(Err(Error::Encode(format!("{e:#}")))),
            Err(e) => return Some(Err(Error::Encode(format!("encoder task failed: {e}")))),
        };
        let payload = match self.mode {
            OutputMode::Binary => ResultPayload::Binary(Bytes::from(encoded)),
            OutputMode::DataUri => ResultPayload::DataUri(data_uri(self.encoder.format(), &encoded)),
        };
        Some(Ok(JobResult {
            id: self.id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            payload,
        }))
    }
}

/// Runs jobs against the inference pipelines and encodes their output.
pub struct JobRunner {
    pipelines: Pipelines,
    encoder: Arc<dyn ImageEncoder>,
    mode: OutputMode,
}

impl JobRunner {
    pub fn new(pipelines: Pipelines, encoder: Arc<dyn ImageEncoder>, mode: OutputMode) -> Self {
        Self {
            pipelines,
            encoder,
            mode,
        }
    }

    /// Calls the generator once on a blocking thread, timing the whole call.
    pub async fn run(&self, request: JobRequest) -> Result<JobOutput> {
        let JobRequest { id, params } = request;
        let generator = self.pipelines.for_params(&params);
        debug!(
            mode = ?params.mode(),
            seed = ?params.seed,
            width = params.width,
            height = params.height,
            images = params.expected_images(),
            "running job"
        );

        let started_at = Utc::now();
        let images = tokio::task::spawn_blocking(move || generator.generate(&params))
            .await
            .map_err(|e| Error::Generation(format!("generator task failed: {e}")))?
            .map_err(|e| Error::Generation(format!("{e:#}")))?;
        let finished_at = Utc::now();

        Ok(JobOutput {
            id,
            started_at,
            finished_at,
            images: images.into_iter(),
            encoder: self.encoder.clone(),
            mode: self.mode,
        })
    }
}

/// Processes queued jobs strictly one at a time, streaming each result to `sink`
/// as soon as it is encoded. Stops forwarding once the session has terminated.
pub fn spawn_job_worker(
    runner: Arc<JobRunner>,
    sink: Arc<dyn ChannelSink>,
    termination: Termination,
) -> (mpsc::UnboundedSender<JobRequest>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobRequest>();

    let handle = tokio::spawn(
        async move {
            while let Some(request) = rx.recv().await {
                if termination.is_terminated() {
                    break;
                }
                let id = request.id.clone();
                match run_one(&runner, sink.as_ref(), &termination, request).await {
                    Ok(sent) => info!(id = %id, sent, "job finished"),
                    Err(e) => warn!(id = %id, error = %e, "job failed"),
                }
            }
            debug!("job worker stopped");
        }
        .in_current_span(),
    );
    (tx, handle)
}

fn fit(message: OutboundMessage, limit: usize) -> Result<OutboundMessage> {
    if message.size() > limit {
        return Err(Error::MessageTooLarge {
            size: message.size(),
            limit,
        });
    }
    Ok(message)
}

/// A result that cannot be encoded or sent is skipped; the rest of the job
/// still goes out. Only a failing channel ends the job early.
async fn run_one(
    runner: &JobRunner,
    sink: &dyn ChannelSink,
    termination: &Termination,
    request: JobRequest,
) -> Result<usize> {
    let id = request.id.clone();
    let mut output = runner.run(request).await?;
    let total = output.remaining();
    let limit = sink.max_message_size();
    let mut sent = 0;

    for index in 1..=total {
        if termination.is_terminated() {
            debug!(sent, "session ended mid-job, dropping remaining results");
            break;
        }
        let Some(result) = output.next_result().await else {
            break;
        };
        match result
            .and_then(JobResult::into_message)
            .and_then(|m| fit(m, limit))
        {
            Ok(message) => {
                sink.deliver(message).await?;
                sent += 1;
            }
            Err(e) => warn!(id = %id, image = index, of = total, error = %e, "result not sent"),
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::codec::{FormatEncoder, ImageFormat};
    use crate::job::pipeline::Generator;
    use crate::job::request::GenerationParams;
    use crate::peer::data_channel::testing::RecordingSink;
    use crate::peer::state::TerminationReason;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn images(n: usize) -> Arc<dyn Generator> {
        Arc::new(move |_: &GenerationParams| {
            (0..n)
                .map(|i| Image::new(2, 2, vec![i as u8; 12]))
                .collect::<anyhow::Result<Vec<_>>>()
        })
    }

    fn runner(generator: Arc<dyn Generator>, mode: OutputMode) -> JobRunner {
        JobRunner::new(
            Pipelines::uniform(generator),
            Arc::new(FormatEncoder::new(ImageFormat::Png)),
            mode,
        )
    }

    fn job(id: i64) -> JobRequest {
        JobRequest::parse(format!(r#"{{"id":{id},"prompt":"cat"}}"#).as_bytes()).unwrap()
    }

    /// Writes `width` zero bytes; blocks on the gate when encoding call `gate_at`.
    struct StubEncoder {
        calls: AtomicUsize,
        gate_at: Option<usize>,
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl StubEncoder {
        fn new(gate_at: Option<usize>) -> (Self, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            let encoder = Self {
                calls: AtomicUsize::new(0),
                gate_at,
                gate: Mutex::new(rx),
            };
            (encoder, tx)
        }
    }

    impl ImageEncoder for StubEncoder {
        fn format(&self) -> &str {
            "raw"
        }

        fn encode(&self, image: &Image) -> anyhow::Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.gate_at {
                let _ = self.gate.lock().unwrap().recv();
            }
            Ok(vec![0; image.width as usize])
        }
    }

    fn widths(widths: &'static [u32]) -> Arc<dyn Generator> {
        Arc::new(move |_: &GenerationParams| {
            widths
                .iter()
                .map(|&w| Image::new(w, 1, vec![0; w as usize * 3]))
                .collect::<anyhow::Result<Vec<_>>>()
        })
    }

    #[test]
    fn test_embedded_result_shape() {
        let result = JobResult {
            id: Value::from(7),
            started_at: Utc.timestamp_millis_opt(1_000).unwrap(),
            finished_at: Utc.timestamp_millis_opt(1_250).unwrap(),
            payload: ResultPayload::DataUri("data:image/webp;base64,AA==".into()),
        };
        let OutboundMessage::Text(text) = result.into_message().unwrap() else {
            panic!("expected text message");
        };
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["gen_time"], 250);
        assert_eq!(json["start"], 1_000);
        assert_eq!(json["end"], 1_250);
        assert_eq!(json["image"], "data:image/webp;base64,AA==");
    }

    #[tokio::test]
    async fn test_run_yields_one_result_per_image() {
        let runner = runner(images(3), OutputMode::DataUri);
        let mut output = runner.run(job(7)).await.unwrap();
        assert_eq!(output.remaining(), 3);

        let mut results = Vec::new();
        while let Some(result) = output.next_result().await {
            results.push(result.unwrap());
        }
        assert_eq!(results.len(), 3);
        for r in &results {
            assert_eq!(r.id, Value::from(7));
            assert_eq!(r.started_at, results[0].started_at);
            assert_eq!(r.finished_at, results[0].finished_at);
            assert!(r.gen_time_ms() >= 0);
            let ResultPayload::DataUri(uri) = &r.payload else {
                panic!("expected data uri");
            };
            assert!(uri.starts_with("data:image/png;base64,"));
        }
    }

    #[tokio::test]
    async fn test_binary_mode_sends_raw_bytes() {
        let runner = runner(images(1), OutputMode::Binary);
        let mut output = runner.run(job(1)).await.unwrap();
        let message = output
            .next_result()
            .await
            .unwrap()
            .unwrap()
            .into_message()
            .unwrap();
        let OutboundMessage::Binary(bytes) = message else {
            panic!("expected binary message");
        };
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn test_generator_failure_yields_no_results() {
        let failing: Arc<dyn Generator> =
            Arc::new(|_: &GenerationParams| -> anyhow::Result<Vec<Image>> {
                anyhow::bail!("CUDA out of memory")
            });
        let err = runner(failing, OutputMode::Binary)
            .run(job(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Generation(msg) if msg.contains("out of memory")));
    }

    #[tokio::test]
    async fn test_worker_keeps_going_after_failed_job() {
        let generator: Arc<dyn Generator> = Arc::new(|params: &GenerationParams| {
            if params.prompt == "boom" {
                anyhow::bail!("pipeline exploded");
            }
            Image::new(1, 1, vec![0; 3]).map(|i| vec![i])
        });
        let sink = Arc::new(RecordingSink::default());
        let (_trigger, termination) = Termination::channel();
        let (jobs, _worker) = spawn_job_worker(
            Arc::new(runner(generator, OutputMode::DataUri)),
            sink.clone(),
            termination,
        );

        jobs.send(JobRequest::parse(br#"{"id":1,"prompt":"boom"}"#).unwrap())
            .unwrap();
        jobs.send(job(2)).unwrap();

        let sent = sink.wait_for(1).await;
        let OutboundMessage::Text(text) = &sent[0] else {
            panic!("expected text message");
        };
        let json: Value = serde_json::from_str(text).unwrap();
        assert_eq!(json["id"], 2);
    }

    #[tokio::test]
    async fn test_first_result_sent_before_rest_are_encoded() {
        let (encoder, release) = StubEncoder::new(Some(1));
        let runner = JobRunner::new(
            Pipelines::uniform(widths(&[3, 5])),
            Arc::new(encoder),
            OutputMode::Binary,
        );
        let sink = Arc::new(RecordingSink::default());
        let (_trigger, termination) = Termination::channel();
        let (jobs, _worker) = spawn_job_worker(Arc::new(runner), sink.clone(), termination);

        jobs.send(job(1)).unwrap();

        // the second encode is parked on the gate
        let sent = sink.wait_for(1).await;
        assert_eq!(sent, vec![OutboundMessage::Binary(Bytes::from(vec![0; 3]))]);

        release.send(()).unwrap();
        let sent = sink.wait_for(2).await;
        assert_eq!(sent[1].size(), 5);
    }

    #[tokio::test]
    async fn test_oversized_result_is_skipped() {
        let (encoder, _release) = StubEncoder::new(None);
        let runner = JobRunner::new(
            Pipelines::uniform(widths(&[10, 500, 20])),
            Arc::new(encoder),
            OutputMode::Binary,
        );
        let sink = Arc::new(RecordingSink::with_limit(100));
        let (_trigger, termination) = Termination::channel();
        let (jobs, worker) = spawn_job_worker(Arc::new(runner), sink.clone(), termination);

        jobs.send(job(1)).unwrap();
        drop(jobs);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        let lens: Vec<usize> = sink.sent().await.iter().map(OutboundMessage::size).collect();
        assert_eq!(lens, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_termination_mid_job_stops_forwarding() {
        let (started_tx, mut started) = mpsc::unbounded_channel::<()>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let slow: Arc<dyn Generator> = Arc::new(move |_: &GenerationParams| {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
            (0..3)
                .map(|_| Image::new(1, 1, vec![0; 3]))
                .collect::<anyhow::Result<Vec<_>>>()
        });
        let sink = Arc::new(RecordingSink::default());
        let (trigger, termination) = Termination::channel();
        let (jobs, worker) = spawn_job_worker(
            Arc::new(runner(slow, OutputMode::Binary)),
            sink.clone(),
            termination,
        );

        jobs.send(job(1)).unwrap();
        jobs.send(job(2)).unwrap();
        drop(jobs);

        started.recv().await.unwrap();
        assert!(trigger.fire(TerminationReason::IdleTimeout));
        release_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(sink.sent().await.is_empty());
        // the queued second job never reached the generator
        assert!(started.try_recv().is_err());
    }
}
