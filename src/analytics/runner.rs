use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::source::{self, FrameSource, SourceError, SourceKind};

use super::pipeline::{
    EffectState, FrameProcessingPipeline, PipelineError, PipelineStatus, ResultBundle, TickOutcome,
};

const COMMAND_CAPACITY: usize = 16;

enum Command {
    SetSource {
        kind: SourceKind,
        locator: String,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    ToggleBackground {
        reply: oneshot::Sender<EffectState>,
    },
    ToggleDetection {
        reply: oneshot::Sender<Result<EffectState, PipelineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Result of a source open running off the pipeline task.
struct Opened {
    generation: u64,
    result: Result<Box<dyn FrameSource>, SourceError>,
}

/// A `set_source` whose open is still in flight.
struct PendingSwitch {
    generation: u64,
    reply: oneshot::Sender<Result<(), PipelineError>>,
    task: JoinHandle<()>,
}

impl PendingSwitch {
    fn cancel(self) {
        self.task.abort();
        let _ = self.reply.send(Err(PipelineError::Superseded));
    }
}

/// Control surface for a pipeline running on its own task.
///
/// Commands are applied between ticks, in the order they were sent. Source
/// opens run on a separate task, so a slow connect never holds up ticks or
/// later commands; `stop` or another `set_source` abandons it. Once every
/// handle is dropped the task stops the pipeline and exits.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
}

impl PipelineHandle {
    /// Resolves once the source is open, has failed, or was superseded.
    pub async fn set_source(&self, kind: SourceKind, locator: impl Into<String>) -> Result<(), PipelineError> {
        let locator = locator.into();
        self.request(|reply| Command::SetSource { kind, locator, reply })
            .await?
    }

    pub async fn toggle_background(&self) -> Result<EffectState, PipelineError> {
        self.request(|reply| Command::ToggleBackground { reply }).await
    }

    pub async fn toggle_detection(&self) -> Result<EffectState, PipelineError> {
        self.request(|reply| Command::ToggleDetection { reply }).await?
    }

    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        self.request(|reply| Command::Status { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)
    }
}

/// Move `pipeline` onto a task that ticks every `period`.
///
/// Bundles go to the returned receiver. If the renderer has not taken the
/// previous bundles the new one is dropped; late ticks are skipped rather
/// than replayed.
pub fn spawn_pipeline(
    pipeline: FrameProcessingPipeline,
    period: Duration,
    bundle_capacity: usize,
) -> (PipelineHandle, mpsc::Receiver<ResultBundle>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (bundle_tx, bundle_rx) = mpsc::channel(bundle_capacity.max(1));
    let task = tokio::spawn(run(pipeline, command_rx, bundle_tx, period));
    (PipelineHandle { commands: command_tx }, bundle_rx, task)
}

async fn run(
    mut pipeline: FrameProcessingPipeline,
    mut commands: mpsc::Receiver<Command>,
    bundles: mpsc::Sender<ResultBundle>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let (opened_tx, mut opened_rx) = mpsc::channel::<Opened>(1);
    let mut pending: Option<PendingSwitch> = None;
    tracing::debug!(period_ms = period.as_millis() as u64, "pipeline task started");

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => apply(&mut pipeline, command, &mut pending, &opened_tx),
                None => break,
            },
            // never closes: `opened_tx` lives as long as this loop
            Some(opened) = opened_rx.recv() => finish_switch(&mut pipeline, &mut pending, opened),
            _ = interval.tick() => match pipeline.tick() {
                TickOutcome::Frame(bundle) => {
                    if let Err(mpsc::error::TrySendError::Full(bundle)) = bundles.try_send(bundle) {
                        tracing::trace!(sequence = bundle.sequence, "renderer busy, dropping bundle");
                    }
                }
                TickOutcome::Ended => tracing::info!("stream ended, pipeline is off"),
                TickOutcome::Idle => {}
            },
        }
    }

    if let Some(switch) = pending.take() {
        switch.cancel();
    }
    pipeline.stop();
    tracing::debug!("pipeline task exited");
}

fn apply(
    pipeline: &mut FrameProcessingPipeline,
    command: Command,
    pending: &mut Option<PendingSwitch>,
    opened_tx: &mpsc::Sender<Opened>,
) {
    // a dropped reply receiver just means the caller stopped waiting
    match command {
        Command::SetSource { kind, locator, reply } => {
            if let Some(previous) = pending.take() {
                previous.cancel();
            }
            let generation = pipeline.begin_switch();
            let stream = pipeline.stream_config().clone();
            let opened = opened_tx.clone();
            let task = tokio::spawn(async move {
                let result = source::open(kind, &locator, &stream).await;
                let _ = opened.send(Opened { generation, result }).await;
            });
            *pending = Some(PendingSwitch {
                generation,
                reply,
                task,
            });
        }
        Command::ToggleBackground { reply } => {
            let _ = reply.send(pipeline.toggle_background());
        }
        Command::ToggleDetection { reply } => {
            let _ = reply.send(pipeline.toggle_detection());
        }
        Command::Stop { reply } => {
            if let Some(switch) = pending.take() {
                switch.cancel();
            }
            pipeline.stop();
            let _ = reply.send(());
        }
        Command::Status { reply } => {
            let _ = reply.send(pipeline.status());
        }
    }
}

fn finish_switch(pipeline: &mut FrameProcessingPipeline, pending: &mut Option<PendingSwitch>, opened: Opened) {
    match pending.take() {
        Some(switch) if switch.generation == opened.generation => {
            let result = pipeline.complete_switch(opened.generation, opened.result);
            let _ = switch.reply.send(result);
        }
        other => {
            // the open finished after being abandoned; dropping it cancels the producer
            tracing::debug!(generation = opened.generation, "discarding abandoned source open");
            *pending = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::classify::ClassificationTally;
    use crate::analytics::motion::solid_frame;
    use crate::analytics::pipeline::tests::{pipeline, ScriptedSource};
    use crate::analytics::pipeline::EffectMode;

    const TICK: Duration = Duration::from_millis(5);

    async fn next_bundle(bundles: &mut mpsc::Receiver<ResultBundle>) -> ResultBundle {
        tokio::time::timeout(Duration::from_secs(5), bundles.recv())
            .await
            .expect("bundle in time")
            .expect("runner alive")
    }

    #[tokio::test]
    async fn test_runner_delivers_bundles() {
        let mut pipeline = pipeline(true);
        let frames = (0..3).map(|_| solid_frame(160, 120, 50.0)).collect();
        pipeline
            .attach_source(Box::new(ScriptedSource::new(frames, false)))
            .unwrap();
        pipeline.toggle_background();
        pipeline.toggle_detection().unwrap();
        let (handle, mut bundles, _task) = spawn_pipeline(pipeline, TICK, 8);

        let bundle = next_bundle(&mut bundles).await;
        assert!(bundle.mask.is_some());
        assert!(bundle.tally.is_some());

        let status = handle.status().await.unwrap();
        assert_eq!(status.effects.mode(), EffectMode::Both);
        assert_eq!(status.source, Some(SourceKind::File));
    }

    #[tokio::test]
    async fn test_runner_stop_resets_state() {
        let mut pipeline = pipeline(true);
        pipeline
            .attach_source(Box::new(ScriptedSource::new(Vec::new(), false)))
            .unwrap();
        let (handle, _bundles, _task) = spawn_pipeline(pipeline, TICK, 1);

        handle.toggle_detection().await.unwrap();
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.effects, EffectState::default());
        assert_eq!(status.source, None);
        assert_eq!(status.tally, ClassificationTally::default());
    }

    #[tokio::test]
    async fn test_runner_reports_missing_detector() {
        let (handle, _bundles, _task) = spawn_pipeline(pipeline(false), TICK, 1);
        assert!(matches!(
            handle.toggle_detection().await,
            Err(PipelineError::DetectorUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_runner_turns_off_when_stream_ends() {
        let mut pipeline = pipeline(false);
        pipeline
            .attach_source(Box::new(ScriptedSource::new(vec![solid_frame(160, 120, 50.0)], true)))
            .unwrap();
        pipeline.toggle_background();
        let (handle, mut bundles, _task) = spawn_pipeline(pipeline, TICK, 4);

        next_bundle(&mut bundles).await;
        let mut status = handle.status().await.unwrap();
        for _ in 0..100 {
            if status.source.is_none() {
                break;
            }
            tokio::time::sleep(TICK).await;
            status = handle.status().await.unwrap();
        }
        assert_eq!(status.source, None);
        assert_eq!(status.effects.mode(), EffectMode::Off);
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_commands() {
        // accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let (handle, _bundles, _task) = spawn_pipeline(pipeline(false), TICK, 1);
        let switching = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .set_source(SourceKind::Network, format!("http://{addr}/video"))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // well inside the 10 s connect timeout
        let quick = Duration::from_secs(2);
        let status = tokio::time::timeout(quick, handle.status())
            .await
            .expect("status answered while connecting")
            .unwrap();
        assert_eq!(status.source, None);
        assert_eq!(
            tokio::time::timeout(quick, handle.toggle_background())
                .await
                .expect("toggle answered while connecting")
                .unwrap()
                .mode(),
            EffectMode::BackgroundOnly
        );

        tokio::time::timeout(quick, handle.stop())
            .await
            .expect("stop answered while connecting")
            .unwrap();
        let result = tokio::time::timeout(quick, switching)
            .await
            .expect("switch settled after stop")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Superseded)));
        assert_eq!(handle.status().await.unwrap().source, None);

        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_source_is_reported() {
        let (handle, _bundles, _task) = spawn_pipeline(pipeline(false), TICK, 1);
        let result = handle
            .set_source(SourceKind::File, "/nonexistent/clip.mp4")
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Source(SourceError::Unavailable { .. }))
        ));
        assert_eq!(handle.status().await.unwrap().effects.mode(), EffectMode::Off);
    }

    #[tokio::test]
    async fn test_task_exits_when_handles_dropped() {
        let (handle, _bundles, task) = spawn_pipeline(pipeline(false), TICK, 1);
        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task exits")
            .unwrap();
    }
}
