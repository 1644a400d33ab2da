use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    purgatory_size: Option<u32>,
    limbo_group_bytes: Option<usize>,
    clean_budget: Option<u32>,
    handle_batch: Option<usize>,
    max_fail: Option<u32>,
    max_key_len: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    purgatory_size: u32,
    limbo_group_bytes: usize,
    limbo_group_capacity: usize,
    clean_budget: u32,
    handle_batch: usize,
    max_fail: u32,
    max_key_len: usize,
}

/// Bytes of LimboGroup bookkeeping before the entry array:
/// head (u32) + tail (u32) + epoch (u64) + next pointer.
const LIMBO_GROUP_OVERHEAD: usize = 4 + 4 + 8 + 8;
/// One retired-pointer entry: pointer word + epoch-or-tag word.
const LIMBO_ENTRY_SIZE: usize = 16;

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let purgatory_size = cfg.purgatory_size.unwrap_or(10);
    let limbo_group_bytes = cfg.limbo_group_bytes.unwrap_or(4096);
    let clean_budget = cfg.clean_budget.unwrap_or(10 * 1024);
    let handle_batch = cfg.handle_batch.unwrap_or(5);
    let max_fail = cfg.max_fail.unwrap_or(4);
    let max_key_len = cfg.max_key_len.unwrap_or(255);

    assert!(purgatory_size > 0, "purgatory_size must be > 0");
    assert!(
        limbo_group_bytes >= LIMBO_GROUP_OVERHEAD + 4 * LIMBO_ENTRY_SIZE,
        "limbo_group_bytes ({}) too small for a usable group",
        limbo_group_bytes
    );
    assert!(clean_budget > 0, "clean_budget must be > 0");
    assert!(
        handle_batch > 0 && handle_batch <= 64,
        "handle_batch ({}) must be in 1..=64",
        handle_batch
    );
    assert!(max_fail > 0, "max_fail must be > 0");
    assert!(
        max_key_len >= 8 && max_key_len <= u16::MAX as usize,
        "max_key_len ({}) must be in 8..=65535",
        max_key_len
    );

    let limbo_group_capacity = (limbo_group_bytes - LIMBO_GROUP_OVERHEAD) / LIMBO_ENTRY_SIZE;

    ResolvedConfig {
        purgatory_size,
        limbo_group_bytes,
        limbo_group_capacity,
        clean_budget,
        handle_batch,
        max_fail,
        max_key_len,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/lfkit.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PURGATORY_SIZE: u32 = {};\n\
         pub const LIMBO_GROUP_BYTES: usize = {};\n\
         pub const LIMBO_GROUP_CAPACITY: usize = {};\n\
         pub const CLEAN_BUDGET: u32 = {};\n\
         pub const HANDLE_BATCH: usize = {};\n\
         pub const MAX_FAIL: u32 = {};\n\
         pub const MAX_KEY_LEN: usize = {};\n",
        cfg.purgatory_size,
        cfg.limbo_group_bytes,
        cfg.limbo_group_capacity,
        cfg.clean_budget,
        cfg.handle_batch,
        cfg.max_fail,
        cfg.max_key_len,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=LFKIT_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("LFKIT_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path).unwrap_or_default();

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");
    let resolved = resolve_config(&config.config);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
