//! Config store and sync loop tests: patch semantics, the model lifecycle
//! and consistency under concurrent patching and scoring.

mod common;

use common::{detection, model_spec, png_bytes, ChannelPatchSource, Harness};
use edge_inference_node::twin::StatusLabel;
use edge_inference_node::{
    AcquireError, ConfigPatch, ConfigSyncLoop, Configuration, ModelStatus, Outcome, TransportError,
    TwinPublisher, UploadPatch,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn tgz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Poll until `check` holds or a second passes.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_partial_patch_leaves_other_fields() {
    let harness = Harness::new(Configuration {
        telemetry_enabled: true,
        annotate_on_score: false,
        upload_interval_seconds: 60,
    });

    let patch = ConfigPatch::from_slice(br#"{"upload": {"interval-sec": 10}}"#).unwrap();
    harness.store.apply_patch(&patch).await;

    assert_eq!(
        harness.store.snapshot(),
        Configuration {
            telemetry_enabled: true,
            annotate_on_score: false,
            upload_interval_seconds: 10,
        }
    );
}

#[tokio::test]
async fn test_model_update_deferred_while_loaded() {
    let harness = Harness::new(Configuration::default());

    harness.load_model("first.onnx").await;
    let state = harness.store.apply_patch(&ConfigPatch {
        model: Some(model_spec("second.onnx")),
        ..Default::default()
    })
    .await;

    assert_eq!(state.status, ModelStatus::Loaded);
    assert_eq!(state.model_name.as_deref(), Some("first.onnx"));
    assert_eq!(harness.stats.loads(), 1);
}

#[tokio::test]
async fn test_archive_artifact_is_extracted_and_loaded() {
    let archive = tgz(&[("ssd.onnx", b"model"), ("labels.txt", b"background\nperson\n")]);
    let harness = Harness::with_artifact(Configuration::default(), archive);

    let spec = model_spec("ssd.onnx");
    let patch = ConfigPatch {
        model: Some(edge_inference_node::ModelSpec {
            filename: "ssd.tgz".to_string(),
            label_name: Some("labels.txt".to_string()),
            ..spec
        }),
        ..Default::default()
    };
    let state = harness.store.apply_patch(&patch).await;

    let work_dir = harness.dir.path().join("model");
    assert_eq!(state.status, ModelStatus::Loaded);
    assert_eq!(state.model_path, Some(work_dir.join("ssd.onnx")));
    assert_eq!(state.label_path, Some(work_dir.join("labels.txt")));
    assert!(!work_dir.join("ssd.tgz").exists());
}

#[tokio::test]
async fn test_failed_load_reports_unknown_and_scores_empty() {
    let harness = Harness::new(Configuration::default());
    harness.stats.fail_loads.store(true, Ordering::SeqCst);
    harness.stats.set_detections(vec![detection("person")]);

    let state = harness.store.apply_patch(&ConfigPatch {
        model: Some(model_spec("bad.onnx")),
        ..Default::default()
    })
    .await;
    assert_eq!(state.status, ModelStatus::Failed);
    assert_eq!(StatusLabel::from(state.status), StatusLabel::Unknown);

    let outcome = harness.scoring.handle_score(png_bytes(16, 16)).await;
    assert_eq!(outcome, Outcome::Empty);
    assert_eq!(harness.stats.score_calls(), 0);

    // the gate stays open after a failure
    harness.stats.fail_loads.store(false, Ordering::SeqCst);
    harness.load_model("good.onnx").await;
    assert_eq!(harness.store.model_state().model_name.as_deref(), Some("good.onnx"));
}

#[tokio::test]
async fn test_sync_loop_applies_and_reports() {
    let harness = Harness::new(Configuration::default());
    let (patch_tx, patch_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = ChannelPatchSource {
        initial: ConfigPatch {
            send_telemetry: Some(true),
            model: Some(model_spec("ssd.onnx")),
            ..Default::default()
        },
        patches: patch_rx,
    };
    let publisher: Arc<dyn TwinPublisher> = harness.publisher.clone();
    let mut sync = ConfigSyncLoop::new(source, harness.store.clone(), publisher);

    sync.initial_sync().await.unwrap();
    assert!(harness.store.snapshot().telemetry_enabled);
    let statuses = harness.publisher.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].current_status.status, StatusLabel::ModelLoaded);
    assert_eq!(statuses[0].current_status.model, "ssd.onnx");

    let handle = sync.spawn(shutdown_rx);

    patch_tx
        .send(Err(TransportError::Malformed("bad json".into())))
        .await
        .unwrap();
    patch_tx
        .send(Ok(ConfigPatch {
            upload: Some(UploadPatch {
                interval_sec: Some(5),
                inference_mark: Some(true),
            }),
            ..Default::default()
        }))
        .await
        .unwrap();

    let publisher = harness.publisher.clone();
    eventually(|| publisher.statuses().len() == 2).await;
    let config = harness.store.snapshot();
    assert_eq!(config.upload_interval_seconds, 5);
    assert!(config.annotate_on_score);

    shutdown_tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_sync_loop_stops_on_lost_transport() {
    let harness = Harness::new(Configuration::default());
    let (patch_tx, patch_rx) = mpsc::channel(1);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = ChannelPatchSource {
        initial: ConfigPatch::default(),
        patches: patch_rx,
    };
    let publisher: Arc<dyn TwinPublisher> = harness.publisher.clone();
    let handle = ConfigSyncLoop::new(source, harness.store.clone(), publisher).spawn(shutdown_rx);

    drop(patch_tx);
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Fatal(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_patches_never_expose_partial_configuration() {
    // every patch writes all three fields so that each snapshot has to satisfy
    // telemetry == annotate == (interval is even)
    let harness = Harness::new(Configuration {
        telemetry_enabled: false,
        annotate_on_score: false,
        upload_interval_seconds: 1,
    });
    harness.load_model("ssd.onnx").await;
    harness.stats.set_detections(vec![detection("person")]);

    let store = harness.store.clone();
    let patcher = tokio::spawn(async move {
        for i in 2..202i64 {
            let even = i % 2 == 0;
            let patch = ConfigPatch {
                send_telemetry: Some(even),
                upload: Some(UploadPatch {
                    interval_sec: Some(i),
                    inference_mark: Some(even),
                }),
                model: None,
            };
            store.apply_patch(&patch).await;
            tokio::task::yield_now().await;
        }
    });

    let mut readers = Vec::new();
    for _ in 0..3 {
        let store = harness.store.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..500 {
                let config = store.snapshot();
                let even = config.upload_interval_seconds % 2 == 0;
                assert_eq!(config.telemetry_enabled, even, "{:?}", config);
                assert_eq!(config.annotate_on_score, even, "{:?}", config);
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut scorers = Vec::new();
    for _ in 0..3 {
        let scoring = harness.scoring.clone();
        scorers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let outcome = scoring.handle_score(png_bytes(8, 8)).await;
                assert!(matches!(outcome, Outcome::Detected(_)), "{:?}", outcome);
            }
        }));
    }

    patcher.await.unwrap();
    for task in readers.into_iter().chain(scorers) {
        task.await.unwrap();
    }

    let config = harness.store.snapshot();
    assert_eq!(config.upload_interval_seconds, 201);
    assert!(!config.telemetry_enabled);
    assert_eq!(harness.stats.score_calls(), 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scoring_proceeds_while_model_download_is_parked() {
    let harness = Harness::new(Configuration::default());
    harness.stats.set_detections(vec![detection("person")]);
    harness.fetcher.gate.close();

    let store = harness.store.clone();
    let apply = tokio::spawn(async move {
        store
            .apply_patch(&ConfigPatch {
                model: Some(model_spec("ssd.onnx")),
                ..Default::default()
            })
            .await
    });
    harness.fetcher.gate.wait_entered().await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        harness.scoring.handle_score(png_bytes(16, 16)),
    )
    .await
    .expect("scoring blocked behind a model download");
    assert_eq!(outcome, Outcome::Empty);
    assert_eq!(harness.stats.score_calls(), 0);

    let store = harness.store.clone();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || store.model_state()),
    )
    .await
    .expect("state read blocked behind a model download")
    .unwrap();
    assert_eq!(state.status, ModelStatus::Unloaded);
    assert!(!apply.is_finished());

    harness.fetcher.gate.open();
    let state = apply.await.unwrap();
    assert_eq!(state.status, ModelStatus::Loaded);
    assert!(matches!(
        harness.scoring.handle_score(png_bytes(16, 16)).await,
        Outcome::Detected(_)
    ));
}

#[tokio::test]
async fn test_stalled_acquisition_times_out_as_failed() {
    let harness = Harness::with_load_timeout(Configuration::default(), Duration::from_millis(50));
    harness.fetcher.gate.close();

    let err = harness.models.acquire(&model_spec("slow.onnx")).await.unwrap_err();
    assert!(matches!(err, AcquireError::TimedOut(_)), "{:?}", err);

    let state = harness
        .store
        .apply_patch(&ConfigPatch {
            model: Some(model_spec("slow.onnx")),
            ..Default::default()
        })
        .await;
    assert_eq!(state.status, ModelStatus::Failed);
    assert_eq!(StatusLabel::from(state.status), StatusLabel::Unknown);
    assert_eq!(harness.stats.loads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_pass_sees_one_configuration() {
    // patches keep telemetry == annotate, so the flag the model was called
    // with decides whether that pass published telemetry
    let harness = Harness::new(Configuration::default());
    harness.load_model("ssd.onnx").await;
    harness.stats.echo_annotate.store(true, Ordering::SeqCst);

    let store = harness.store.clone();
    let patcher = tokio::spawn(async move {
        for i in 0..300 {
            let on = i % 2 == 0;
            store
                .apply_patch(&ConfigPatch {
                    send_telemetry: Some(on),
                    upload: Some(UploadPatch {
                        interval_sec: Some(3600),
                        inference_mark: Some(on),
                    }),
                    model: None,
                })
                .await;
            tokio::task::yield_now().await;
        }
    });

    let mut scorers = Vec::new();
    for _ in 0..4 {
        let scoring = harness.scoring.clone();
        scorers.push(tokio::spawn(async move {
            let mut annotated = 0usize;
            for _ in 0..25 {
                match scoring.handle_score(png_bytes(8, 8)).await {
                    Outcome::Detected(result) => {
                        let label = &result.detections[0].label;
                        assert_eq!(result.annotated.is_some(), label == "annotated");
                        if label == "annotated" {
                            annotated += 1;
                        }
                    }
                    other => panic!("expected detections, got {:?}", other),
                }
            }
            annotated
        }));
    }

    patcher.await.unwrap();
    let mut annotated = 0;
    for task in scorers {
        annotated += task.await.unwrap();
    }

    let telemetry = harness.publisher.telemetry();
    assert_eq!(telemetry.len(), annotated);
    for message in &telemetry {
        assert_eq!(message.counts_by_label.get("annotated"), Some(&1), "{:?}", message);
        assert_eq!(message.total_detections, 1);
    }
    assert_eq!(harness.stats.score_calls(), 100);
}
