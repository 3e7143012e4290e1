//! Execution trace recorded across training and exported mid-run

use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn_ndarray::NdArray;

use tumor_unet::training::trainer::{adam_trainer, evaluate_model};
use tumor_unet::utils::logging::{export_trace, init_logging, LogConfig, LogLevel};
use tumor_unet::{SegmentationDataset, TrainingConfig, UNet, Volume};

type TestBackend = Autodiff<NdArray<f32>>;

fn striped_dataset(n: usize) -> SegmentationDataset {
    let pixels = n * 8 * 8;
    let images = (0..pixels).map(|i| if i % 8 < 4 { 1.0 } else { -1.0 }).collect();
    let masks = (0..pixels).map(|i| if i % 8 < 4 { 1.0 } else { 0.0 }).collect();
    SegmentationDataset::new(
        Volume::new([n, 8, 8, 1], images).unwrap(),
        Volume::new([n, 8, 8, 1], masks).unwrap(),
    )
    .unwrap()
}

#[test]
fn test_trace_holds_train_steps_and_logging_survives_export() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("timeline_unet_30_2_1.json");
    let log_config = LogConfig {
        level: LogLevel::Debug,
        ..LogConfig::default()
    }
    .with_trace_file(&trace_path);
    init_logging(&log_config).unwrap();

    let device = Default::default();
    let config = TrainingConfig {
        output_dir: dir.path().to_path_buf(),
        batch_size: 2,
        filters: vec![2, 4],
        ..Default::default()
    };
    let data = striped_dataset(5);
    let model = UNet::<TestBackend>::new(&config.unet_config(), &device);
    let mut trainer = adam_trainer(model, config.clone(), device);
    let stats = trainer.train_epoch(&data).unwrap();
    assert_eq!(stats.batches, 3);

    let exported = export_trace().unwrap();
    assert_eq!(exported, trace_path);
    assert!(export_trace().is_none());

    let events: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&exported).unwrap()).unwrap();
    let steps = events.iter().filter(|e| e["name"] == "train_step").count();
    assert!(steps >= 3, "expected a span per batch, found {}", steps);

    // Spans after export go to the log only
    let metrics = evaluate_model(&trainer.model.valid(), &data, &config, trainer.device()).unwrap();
    assert_eq!(metrics.samples, 5);
    let size_after = std::fs::metadata(&exported).unwrap().len();
    trainer.train_epoch(&data).unwrap();
    assert_eq!(std::fs::metadata(&exported).unwrap().len(), size_after);
}
