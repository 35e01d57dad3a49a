use std::path::{Path, PathBuf};

const LUA_SCRIPTS: &[&str] = &["src/lua/promote_delayed.lua", "src/lua/requeue_direct.lua"];

fn main() {
    let manifest_dir = match std::env::var_os("CARGO_MANIFEST_DIR") {
        Some(value) => PathBuf::from(value),
        None => panic!("CARGO_MANIFEST_DIR is not set for build script"),
    };

    for relative_path in LUA_SCRIPTS {
        let script_path = manifest_dir.join(relative_path);
        println!("cargo:rerun-if-changed={}", script_path.display());
        validate_lua_script(&script_path);
    }
}

fn validate_lua_script(script_path: &Path) {
    let source = std::fs::read_to_string(script_path).unwrap_or_else(|error| {
        panic!(
            "failed to read Lua script '{}': {error}",
            script_path.display()
        )
    });
    if source.trim().is_empty() {
        panic!("Lua script '{}' is empty", script_path.display());
    }
}
