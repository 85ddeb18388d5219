use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

fn main() -> anyhow::Result<()> {
    // Tell Cargo to re-run this script if shaders change
    println!("cargo:rerun-if-changed=shaders");

    let out_dir = env::var("OUT_DIR")?;
    let shader_dir = Path::new("shaders");
    if !shader_dir.exists() {
        return Ok(());
    }

    let compiler = shaderc::Compiler::new().ok_or_else(|| anyhow!("shaderc unavailable"))?;
    let mut options =
        shaderc::CompileOptions::new().ok_or_else(|| anyhow!("shaderc options unavailable"))?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for entry in fs::read_dir(shader_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        let kind = if file_name.ends_with(".vert") {
            shaderc::ShaderKind::Vertex
        } else if file_name.ends_with(".frag") {
            shaderc::ShaderKind::Fragment
        } else if file_name.ends_with(".comp") {
            shaderc::ShaderKind::Compute
        } else {
            continue;
        };

        let source = fs::read_to_string(&path)
            .with_context(|| format!("reading shader {}", path.display()))?;
        let binary = compiler
            .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
            .map_err(|e| anyhow!("Failed to compile shader {file_name}: {e}"))?;

        let out_path = PathBuf::from(&out_dir).join(format!("{file_name}.spv"));
        fs::write(&out_path, binary.as_binary_u8())?;
    }

    Ok(())
}
