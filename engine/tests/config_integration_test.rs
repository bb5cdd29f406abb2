//! Integration tests for configuration management
//!
//! Verifies that config files are loaded, validated and processed with
//! path expansion and canonicalization, and that the derived context
//! components pick up the configured values.

use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

use amber_engine::config::Config;
use amber_engine::context::{KeywordOverlapScorer, RelevanceScorer};
use sdk::errors::EngineError;

#[test]
fn test_load_full_config_file() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        format!(
            r#"
[core]
log_level = "debug"
data_dir = "{}"

[backend]
base_url = "http://127.0.0.1:11434"
default_model = "qwen2.5:7b"
request_timeout_secs = 120

[context]
chunk_size = 800
chunk_overlap = 100
branching_factor = 4
summary_max_chars = 256
beam_width = 2
max_depth = 5
top_k = 8
chars_per_token = 4
scratchpad_max_chars = 50000
auto_index = false

[runs]
default_ctx_window = 8192
default_loop_count = 2
definitions_file = "defs.json"
"#,
            data_dir.display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert!(config.core.data_dir.is_absolute());
    assert!(data_dir.exists());
    assert_eq!(config.backend.default_model, "qwen2.5:7b");
    assert_eq!(config.definitions_path(), config.core.data_dir.join("defs.json"));

    let params = config.context.retrieval_params();
    assert_eq!((params.beam_width, params.max_depth, params.top_k), (2, 5, 8));

    let scorer: Arc<dyn RelevanceScorer> = Arc::new(KeywordOverlapScorer);
    let budgeter = config.context.budgeter(scorer);
    assert_eq!(budgeter.max_chars(8192), 8192 * 4);
    // The scratchpad cap is clamped into its supported range
    assert_eq!(budgeter.scratchpad_max_chars(), 20_000);
}

#[test]
fn test_minimal_config_with_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        format!(
            "[core]\nlog_level = \"info\"\ndata_dir = \"{}\"\n",
            dir.path().display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.backend.base_url, "http://localhost:11434");
    assert_eq!(config.runs.default_ctx_window, 4096);
    assert_eq!(config.context.branching_factor, 3);
    assert!(config.context.auto_index);
}

#[test]
fn test_load_or_create_reads_existing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    // An existing file is loaded, not overwritten
    let mut seed = Config::default();
    seed.core.data_dir = dir.path().join("data");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, toml::to_string_pretty(&seed).unwrap()).unwrap();

    let loaded = Config::load_or_create_at(&path).unwrap();
    assert_eq!(loaded.backend, seed.backend);
    assert_eq!(loaded.context, seed.context);
}

#[test]
fn test_invalid_values_are_config_errors() {
    let dir = tempdir().unwrap();
    let cases = [
        "[core]\nlog_level = \"loud\"\n",
        "[core]\nlog_level = \"info\"\n[backend]\nbase_url = \"localhost:11434\"\n",
        "[core]\nlog_level = \"info\"\n[context]\nchunk_size = 100\nchunk_overlap = 100\n",
        "[core]\nlog_level = \"info\"\n[runs]\ndefault_loop_count = 0\n",
    ];

    for (i, body) in cases.iter().enumerate() {
        let path = dir.path().join(format!("bad{}.toml", i));
        fs::write(&path, body).unwrap();
        let result = Config::load_from_path(&path);
        assert!(
            matches!(result, Err(EngineError::Config(_))),
            "case {} should fail validation",
            i
        );
    }
}

#[test]
fn test_malformed_toml_is_config_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[core\nlog_level = ").unwrap();
    assert!(matches!(
        Config::load_from_path(&path),
        Err(EngineError::Config(_))
    ));
}
