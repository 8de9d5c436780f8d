//! Convex hull compiler
//!
//! Pre-cooks collision caches for one model: every hull declared in its
//! physics info, plus a `convex<i>` hull per mesh. Run from the asset root
//! (or pass it with --assets). Exits 0 on success, 1 when the model or
//! arguments are missing.

use anyhow::Result;
use prism_asset::Assets;
use prism_physics::{build_convex_hulls, load_collision_cache, save_collision_cache};
use std::sync::Arc;

fn usage() {
    eprintln!("usage: hull_compiler [--assets <dir>] <model_name>");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut asset_dir = String::from("assets");
    let mut model_name = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--assets" => match args.next() {
                Some(dir) => asset_dir = dir,
                None => {
                    usage();
                    std::process::exit(1);
                }
            },
            name if model_name.is_none() => model_name = Some(name.to_string()),
            _ => {
                usage();
                std::process::exit(1);
            }
        }
    }
    let Some(model_name) = model_name else {
        usage();
        std::process::exit(1);
    };

    let assets = Arc::new(Assets::new(asset_dir));
    let Some(model) = assets.load_model(&model_name).wait() else {
        tracing::error!(model = %model_name, "hull_compiler could not load model");
        std::process::exit(1);
    };
    let physics_info = assets.load_physics_info(&model_name).wait();

    let mut updated = false;
    let mut hull_names: Vec<String> = Vec::new();
    if let Some(info) = physics_info.as_deref() {
        hull_names.extend(
            info.hulls()
                .filter_map(|hull| hull.name.strip_prefix(&format!("{model_name}.")))
                .map(str::to_string),
        );
    }
    for index in 0..model.mesh_count() {
        hull_names.push(format!("convex{index}"));
    }

    for hull_name in hull_names {
        let settings = match physics_info.as_deref() {
            Some(info) => info.hull(&hull_name),
            None => prism_asset::HullSettings::for_mesh(&model_name, &hull_name, 0),
        };
        if load_collision_cache(&assets, &model, &settings).is_some() {
            continue;
        }

        println!("Updating physics collision cache: {}", settings.name);
        let Some(set) = build_convex_hulls(&model, &settings) else {
            tracing::error!(hull = %settings.name, "hull build failed");
            continue;
        };
        save_collision_cache(&assets, &model, &settings, &set);
        updated = true;
    }

    // Create or touch the per-model marker
    let marker = format!("cache/collision/{model_name}");
    if updated || !assets.exists(&marker) {
        assets.output_stream(&marker)?;
    }
    Ok(())
}
