use stop_predict::{
    experiment_config_from_env, init_logging, load_splits, log_run_finish, log_run_start,
    logging_config_from_env, prepare, run_sweep, verify_phases, write_reports, LstmClassifier,
    RunReport,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = experiment_config_from_env();
    log_run_start(&logging_cfg, &cfg.data_path, cfg.lookback);

    let splits = load_splits(&cfg.data_path, &cfg.dataset)?;
    let prepared = prepare(&splits, cfg.lookback)?;

    let n_features = splits.feature_names.len();
    let outcome = run_sweep(&prepared, &cfg.sweep, &cfg.report, || {
        LstmClassifier::new(cfg.model.clone(), n_features)
    })?;

    for result in &outcome.results {
        println!(
            "BATCH: {}\tLEARNING RATE: {}\tAUC_SCORE: {}",
            result.params.batch_size,
            result.params.learning_rate,
            result
                .evaluation
                .auc
                .map_or_else(|| "undefined".to_string(), |auc| auc.to_string())
        );
    }

    let best_auc = outcome.best().and_then(|best| best.evaluation.auc);
    let verification = match (cfg.verify, outcome.best_model) {
        (true, Some(model)) => {
            let (_model, phases) =
                verify_phases(model, &prepared, &cfg.verify_phases, &cfg.report)?;
            for (phase_idx, results) in phases.iter().enumerate() {
                println!("VERIFICATION PHASE: {}", phase_idx + 1);
                for (idx, result) in results.iter().enumerate() {
                    let cm = result.evaluation.confusion.as_matrix();
                    println!(
                        "PARAM VERIFICATION: {}\tBATCH: {}\tLEARNING RATE: {}\tAUC_SCORE: {:?}\tCONFUSION: {:?}",
                        idx + 1,
                        result.params.batch_size,
                        result.params.learning_rate,
                        result.evaluation.auc,
                        cm
                    );
                }
            }
            phases
        }
        _ => Vec::new(),
    };

    let report = RunReport {
        generated_at_utc: chrono::Utc::now(),
        lookback: cfg.lookback,
        scaler_fingerprint: prepared.scaler.params().map(|params| params.fingerprint()),
        sweep: outcome.results,
        verification,
    };
    write_reports(&cfg.output_dir, &report)?;
    log_run_finish(report.sweep.len(), best_auc, &cfg.output_dir);

    Ok(())
}
