//! Miniature end-to-end run on synthetic arrays

use std::path::Path;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

use tumor_unet::backend::{init_backend, ThreadConfig};
use tumor_unet::dataset::loader::{split_paths, TEST_SUFFIX, TRAIN_SUFFIX};
use tumor_unet::dataset::npy::{read_volume, write_volume};
use tumor_unet::training::checkpoint::{CheckpointStore, RestoreOutcome};
use tumor_unet::training::run::run_training;
use tumor_unet::{TrainingConfig, Volume};

type TestBackend = Autodiff<NdArray<f32>>;

const SIZE: usize = 16;
const MODALITIES: usize = 4;

/// Square tumor with a bright FLAIR signal, offset per sample
fn write_split(dir: &Path, suffix: &str, n: usize) {
    let mut images = Volume::zeros([n, SIZE, SIZE, MODALITIES]);
    let mut masks = Volume::zeros([n, SIZE, SIZE, 4]);

    for s in 0..n {
        let lo = 2 + s % 4;
        for h in 0..SIZE {
            for w in 0..SIZE {
                let inside = (lo..lo + 6).contains(&h) && (lo..lo + 6).contains(&w);
                let px = ((s * SIZE + h) * SIZE + w) * MODALITIES;
                for c in 0..MODALITIES {
                    images.data_mut()[px + c] = 0.1 * c as f32;
                }
                if inside {
                    images.data_mut()[px + 2] = 1.0;
                    masks.data_mut()[((s * SIZE + h) * SIZE + w) * 4 + 1] = 1.0;
                }
            }
        }
    }

    let (image_path, mask_path) = split_paths(dir, suffix);
    write_volume(&image_path, &images).unwrap();
    write_volume(&mask_path, &masks).unwrap();
}

fn tiny_config(data: &Path, output: &Path) -> TrainingConfig {
    TrainingConfig {
        data_dir: data.to_path_buf(),
        output_dir: output.to_path_buf(),
        model_name: "unet_test".to_string(),
        epochs: 2,
        batch_size: 4,
        filters: vec![4, 8],
        trace: false,
        threads: ThreadConfig {
            intra_op_threads: 2,
            inter_op_threads: 1,
            blocktime_ms: 0,
        },
        ..Default::default()
    }
}

#[test]
fn test_train_predict_and_restore() {
    let data = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_split(data.path(), TRAIN_SUFFIX, 6);
    write_split(data.path(), TEST_SUFFIX, 3);

    let config = tiny_config(data.path(), output.path());
    let runtime = init_backend(&config.threads).unwrap();

    let summary = run_training::<TestBackend>(&config, &runtime, Default::default()).unwrap();
    assert_eq!(summary.epochs, 2);
    assert!(summary.best_loss.is_finite());
    assert_eq!(summary.checkpoints_written.first(), Some(&1));
    assert!(!summary.restore.is_restored());
    assert!(summary.model_json.exists());
    assert_eq!(summary.history, output.path().join("unet_test_history.json"));
    let history: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary.history).unwrap()).unwrap();
    assert_eq!(history["train_losses"].as_array().unwrap().len(), 2);
    assert_eq!(history["eval_history"].as_array().unwrap().len(), 2);
    assert!(summary.trace.is_none());
    assert!((0.0..=1.0).contains(&summary.final_metrics.dice));
    assert_eq!(summary.final_metrics.samples, 3);

    let predictions = read_volume(&summary.predictions).unwrap();
    assert_eq!(predictions.shape(), [3, SIZE, SIZE, 1]);
    assert!(predictions.data().iter().all(|p| (0.0..=1.0).contains(p)));

    let store = CheckpointStore::new(output.path(), "unet_test");
    assert_eq!(summary.best_checkpoint, Some(store.best_path()));
    assert!(store.has_best());

    // A second run picks up the best checkpoint
    let again = run_training::<TestBackend>(
        &TrainingConfig {
            epochs: 1,
            predict_from_best: true,
            ..config
        },
        &runtime,
        Default::default(),
    )
    .unwrap();
    assert!(matches!(again.restore, RestoreOutcome::Restored { .. }));
}

#[test]
fn test_missing_data_is_an_error() {
    let data = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let config = tiny_config(data.path(), output.path());
    let runtime = init_backend(&config.threads).unwrap();

    assert!(run_training::<TestBackend>(&config, &runtime, Default::default()).is_err());
}
