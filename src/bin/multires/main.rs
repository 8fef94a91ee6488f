//! Multires CLI - multiresolution grid command-line tool.
//!
//! Usage: multires <COMMAND> [OPTIONS] <INPUT> [OUTPUT]
//!
//! Run `multires --help` for available commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};

use multires::algo::subdivide::{catmull_clark_subdivide, SubdivideOptions};
use multires::grid::{Grid, GridSettings, QuadTreeGrid, UniformGrid};
use multires::io;
use multires::mesh::HalfEdgeMesh;
use multires::multires::MultiresMesh;
use multires::patch::PatchOptions;

#[derive(Parser)]
#[command(name = "multires")]
#[command(author, version, about = "Multiresolution grid CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display mesh information
    Info {
        /// Input mesh file
        input: PathBuf,
    },

    /// Refine the cage itself with Catmull-Clark
    Refine {
        /// Input mesh file
        input: PathBuf,

        /// Output mesh file
        output: PathBuf,

        /// Number of refinement steps
        #[arg(short, long, default_value = "1")]
        iterations: usize,

        /// Smooth boundary vertices like interior ones
        #[arg(long)]
        smooth_boundary: bool,

        /// Use single-threaded execution
        #[arg(long)]
        sequential: bool,
    },

    /// Build per-corner grids on the limit surface and write them out
    Subdivide {
        /// Input mesh file
        input: PathBuf,

        /// Output mesh file (triangulated grids)
        output: PathBuf,

        /// Grid dimension (points per side, 2^k + 1)
        #[arg(short, long, default_value = "9")]
        dimension: usize,

        /// Use adaptive quadtree grids instead of uniform grids
        #[arg(short, long)]
        adaptive: bool,

        /// Deepest quadtree level to tessellate
        #[arg(long, requires = "adaptive")]
        depth_limit: Option<u32>,

        /// Use single-threaded execution (for benchmarking)
        #[arg(long)]
        sequential: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Info { input } => {
            cmd_info(&input)?;
        }

        Commands::Refine {
            input,
            output,
            iterations,
            smooth_boundary,
            sequential,
        } => {
            let options = SubdivideOptions::new(iterations)
                .with_preserve_boundary(!smooth_boundary)
                .with_parallel(!sequential);
            cmd_refine(&input, &output, &options)?;
        }

        Commands::Subdivide {
            input,
            output,
            dimension,
            adaptive,
            depth_limit,
            sequential,
        } => {
            let mut settings = GridSettings::new().with_parallel(!sequential);
            if let Some(depth) = depth_limit {
                settings = settings.with_depth_limit(depth);
            }
            if adaptive {
                cmd_subdivide::<QuadTreeGrid>(&input, &output, dimension, settings)?;
            } else {
                cmd_subdivide::<UniformGrid>(&input, &output, dimension, settings)?;
            }
        }
    }

    Ok(())
}

fn cmd_info(input: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mesh: HalfEdgeMesh = io::load(input)?;

    println!("File: {}", input.display());
    println!("Vertices: {}", mesh.num_vertices());
    println!("Faces: {}", mesh.num_faces());
    println!("Half-edges: {}", mesh.num_halfedges());
    println!("Grids (face corners): {}", mesh.loop_ids().count());

    if let Some((min, max)) = mesh.bounding_box() {
        println!("Bounding box: ({:.3}, {:.3}, {:.3}) to ({:.3}, {:.3}, {:.3})",
            min.x, min.y, min.z, max.x, max.y, max.z);
    }

    if mesh.is_triangle_mesh() {
        println!("Mesh type: Triangle mesh");
    } else if mesh.is_quad_mesh() {
        println!("Mesh type: Quad mesh");
    } else {
        println!("Mesh type: Mixed polygon mesh");
    }

    let mut valences: BTreeMap<usize, usize> = BTreeMap::new();
    for v in mesh.vertex_ids() {
        *valences.entry(mesh.valence(v)).or_default() += 1;
    }
    println!("Valence histogram:");
    for (valence, count) in &valences {
        println!("  {:>3}: {}", valence, count);
    }

    let boundary_verts = mesh.vertex_ids()
        .filter(|&v| mesh.is_boundary_vertex(v))
        .count();
    if boundary_verts == 0 {
        println!("Topology: Closed (no boundary)");
    } else {
        println!("Topology: Open ({} boundary vertices)", boundary_verts);
    }

    Ok(())
}

fn cmd_refine(
    input: &Path,
    output: &Path,
    options: &SubdivideOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut mesh: HalfEdgeMesh = io::load(input)?;
    println!("Loaded: {} vertices, {} faces", mesh.num_vertices(), mesh.num_faces());

    let start = Instant::now();
    catmull_clark_subdivide(&mut mesh, options)?;
    let elapsed = start.elapsed();

    println!(
        "Result: {} vertices, {} faces after {} step(s)",
        mesh.num_vertices(),
        mesh.num_faces(),
        options.iterations
    );
    io::save(&mesh, output)?;
    println!("Saved: {} ({:.2?})", output.display(), elapsed);

    Ok(())
}

fn cmd_subdivide<G: Grid>(
    input: &Path,
    output: &Path,
    dimension: usize,
    settings: GridSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    let mesh: HalfEdgeMesh = io::load(input)?;

    println!("Loaded: {} vertices, {} faces", mesh.num_vertices(), mesh.num_faces());

    let mode = if settings.parallel { "parallel" } else { "sequential" };
    let patch_options = PatchOptions::default().with_parallel(settings.parallel);
    let mut multires = MultiresMesh::<G>::new(mesh, dimension)?
        .with_settings(settings)
        .with_patch_options(patch_options);

    println!("Building grids (dimension {}, {})...", dimension, mode);
    let start = Instant::now();
    multires.init_grids()?;
    let projected = multires.reproject()?;
    let (positions, triangles) = multires.tessellate();
    let elapsed = start.elapsed();

    println!("Result: {} points projected, {} triangles", projected, triangles.len());
    io::save_triangles(&positions, &triangles, output)?;
    println!("Saved: {} ({:.2?})", output.display(), elapsed);

    Ok(())
}
