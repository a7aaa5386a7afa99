//! Model runs dispatched through the single-slot operation queue

mod common;

use common::Workspace;
use enhance::{
    backends::test_utils::MockBehavior, JobOutcome, MaskRef, OperationEdit, OperationKind, OperationQueue,
    OutputFile, Result,
};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_runs_complete_in_history() -> Result<()> {
    let ws = Workspace::new()?;
    let (runner, factory) = ws.runner("1x/brighten.onnx", MockBehavior::Brighten(0.1), false)?;
    let runner = Arc::new(runner);
    let queue = Arc::new(OperationQueue::new(8));

    let mut handles = Vec::new();
    for kind in [OperationKind::Sharpen, OperationKind::Denoise] {
        let queue = Arc::clone(&queue);
        let runner = Arc::clone(&runner);
        let base = Arc::clone(&ws.base);
        handles.push(tokio::spawn(async move {
            let job = queue.job(kind.to_string());
            queue
                .submit(job, move |job| runner.run(base, kind, Vec::new(), job))
                .await
        }));
    }

    let mut files = Vec::new();
    for handle in handles {
        let file = handle.await.expect("task")?;
        files.push(file.expect("not cancelled"));
    }

    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.operations().len() == 1));
    assert_ne!(files[0].path(), files[1].path());
    assert_eq!(factory.backends_created(), 2);

    let history = queue.history();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.outcome == JobOutcome::Completed && r.completed == r.total));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_queued_edit_keeps_chain() -> Result<()> {
    let ws = Workspace::new()?;
    let (runner, _) = ws.runner("1x/brighten.onnx", MockBehavior::Brighten(0.1), false)?;
    let runner = Arc::new(runner);
    let queue = OperationQueue::new(4);

    let worker = Arc::clone(&runner);
    let base = Arc::clone(&ws.base);
    let file: OutputFile = queue
        .submit(queue.job("sharpen"), move |job| worker.run(base, OperationKind::Sharpen, Vec::new(), job))
        .await?
        .expect("not cancelled");
    let path = file.path().to_path_buf();

    let job = queue.job("edit masks");
    job.cancel();
    let worker = Arc::clone(&runner);
    let mut edited = file.clone();
    let result = queue
        .submit(job, move |job| {
            worker
                .rerun_operation_chain(&mut edited, 0, OperationEdit::masks(vec![MaskRef::new("subject", false)]), job)
                .map(|report| report.map(|_| edited))
        })
        .await?;

    assert!(result.is_none());
    assert_eq!(file.path(), path);
    assert_eq!(queue.latest().expect("record").outcome, JobOutcome::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_failed_run_is_recorded() -> Result<()> {
    let ws = Workspace::new()?;
    let (runner, _) = ws.runner("1x/broken.onnx", MockBehavior::FailAfter(0), false)?;
    let runner = Arc::new(runner);
    let queue = OperationQueue::new(4);

    let base = Arc::clone(&ws.base);
    let result = queue
        .submit(queue.job("broken"), move |job| runner.run(base, OperationKind::Denoise, Vec::new(), job))
        .await;

    assert!(result.is_err());
    assert!(matches!(queue.latest().expect("record").outcome, JobOutcome::Failed(_)));
    assert!(!queue.is_busy());
    Ok(())
}
