//! Mirror a wayland output or toplevel, counting the captured frames

use std::{
    cell::Cell,
    path::PathBuf,
    process::ExitCode,
    rc::Rc,
    time::Duration,
};

use clap::Parser;
use tracing::{debug, error, info, warn};

use smithay_mirror::{
    backend::{
        allocator::DmabufAllocator,
        dmabuf::Dmabuf,
        import::{ImportError, ImportParams, ShmFrame, TextureImporter},
    },
    config::{BackendMode, MirrorOptions, DEFAULT_FATAL_FAIL_COUNT, DEFAULT_RENDER_NODE},
    event_loop,
    mirror::MirrorError,
    reexports::calloop::timer::{TimeoutAction, Timer},
    state::Collaborators,
    target::TargetSpec,
    utils::Region,
};

#[derive(Debug, Parser)]
#[command(about = "Mirror a wayland output or toplevel")]
struct Args {
    /// What to mirror: `output:NAME`, `toplevel:ID`, `null:` or a bare output name
    target: TargetSpec,
    /// Capture backend to use
    ///
    /// `xdg-portal` needs a media transport for the screencast stream, which this tool does not
    /// provide: `auto` never selects it and requesting it explicitly fails.
    #[arg(short, long, default_value = "auto")]
    backend: BackendMode,
    /// Do not paint the cursor into captured frames
    #[arg(long)]
    no_cursor: bool,
    /// Only mirror a part of the target, as `x,y wxh`
    #[arg(short, long)]
    region: Option<Region>,
    /// Frames requested per second
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Stop after this many frames were captured
    #[arg(long)]
    frames: Option<u64>,
    /// Consecutive failures after which a backend is abandoned
    #[arg(long, default_value_t = DEFAULT_FATAL_FAIL_COUNT)]
    fail_threshold: u32,
    /// Render node used for allocating dmabufs
    #[arg(long, default_value = DEFAULT_RENDER_NODE)]
    render_node: PathBuf,
}

/// Counts frames instead of turning them into textures
#[derive(Debug)]
struct CountingImporter {
    imported: Rc<Cell<u64>>,
}

impl CountingImporter {
    fn count(&self) {
        self.imported.set(self.imported.get() + 1);
    }
}

impl TextureImporter for CountingImporter {
    fn import_shm(&mut self, frame: &ShmFrame<'_>, params: &ImportParams) -> Result<(), ImportError> {
        if frame.data.len() < (frame.stride as usize) * (frame.height as usize) {
            return Err(ImportError::Failed(format!(
                "short frame: {} bytes for {} rows of {}",
                frame.data.len(),
                frame.height,
                frame.stride
            )));
        }
        self.count();
        debug!(
            frame = self.imported.get(),
            format = ?frame.format,
            size = ?(frame.width, frame.height),
            ?params,
            "Imported shm frame"
        );
        Ok(())
    }

    fn import_dmabuf(&mut self, dmabuf: &Dmabuf, params: &ImportParams) -> Result<(), ImportError> {
        self.count();
        debug!(
            frame = self.imported.get(),
            format = ?dmabuf.format(),
            size = ?dmabuf.size(),
            planes = dmabuf.num_planes(),
            ?params,
            "Imported dmabuf frame"
        );
        Ok(())
    }
}

fn init_logging() {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().compact().init();
    }
}

#[cfg(feature = "backend_gbm")]
fn open_allocator(node: &std::path::Path) -> Option<Box<dyn DmabufAllocator>> {
    use smithay_mirror::backend::allocator::GbmDmabufAllocator;

    match GbmDmabufAllocator::open(node) {
        Ok(allocator) => Some(Box::new(allocator)),
        Err(err) => {
            tracing::warn!(node = %node.display(), %err, "No dmabuf allocator, dmabuf destinations disabled");
            None
        }
    }
}

#[cfg(not(feature = "backend_gbm"))]
fn open_allocator(node: &std::path::Path) -> Option<Box<dyn DmabufAllocator>> {
    debug!(node = %node.display(), "Built without gbm, dmabuf destinations disabled");
    None
}

fn run(args: Args) -> Result<(), MirrorError> {
    let imported = Rc::new(Cell::new(0));
    let options = MirrorOptions {
        target: args.target,
        backend: args.backend,
        show_cursor: !args.no_cursor,
        region: args.region,
        fatal_fail_count: args.fail_threshold,
        render_node: args.render_node,
    };
    let collaborators = Collaborators {
        importer: Box::new(CountingImporter {
            imported: imported.clone(),
        }),
        allocator: open_allocator(&options.render_node),
        transport: None,
    };
    if options.backend == BackendMode::XdgPortal {
        warn!("No media transport available, the xdg-portal backend cannot be started");
    }

    let (mut event_loop, mut state) = event_loop::init(options, collaborators)?;
    let interval = Duration::from_secs(1) / args.fps.max(1);
    event_loop::insert_frame_clock(&event_loop.handle(), interval)?;

    if let Some(limit) = args.frames {
        event_loop
            .handle()
            .insert_source(Timer::from_duration(interval), move |_, _, state| {
                if imported.get() < limit {
                    return TimeoutAction::ToDuration(interval);
                }
                info!(frames = imported.get(), "Frame limit reached");
                state.close();
                TimeoutAction::Drop
            })
            .map_err(|err| err.error)?;
    }

    event_loop::run(&mut event_loop, &mut state)
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
