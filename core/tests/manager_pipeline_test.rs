use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use aw_man_core::config::Config;
use aw_man_core::manager::{self, ManagerOptions};
use aw_man_core::types::{Command, Executable, ImageDimensions, Modes, State, UserCommand};

fn png_bytes(w: u32, h: u32, shade: u8) -> Vec<u8> {
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_pixel(w, h, Rgba([shade, shade.wrapping_add(40), 80, 255]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img).write_to(&mut cursor, ImageFormat::Png).unwrap();
    cursor.into_inner()
}

fn create_zip(path: &Path, pages: usize, width: u32, height: u32) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for i in 0..pages {
        zip.start_file(format!("{:03}.png", i + 1), options).unwrap();
        zip.write_all(&png_bytes(width, height, i as u8)).unwrap();
    }
    zip.finish().unwrap();
}

fn test_config(temp_root: &Path) -> Arc<Config> {
    Arc::new(Config {
        upscaling_target: None,
        temp_directory: temp_root.to_path_buf(),
        preload_ahead: 3,
        preload_behind: 3,
        load_threads: 2,
        maximum_upscaled: 0,
        upscale_previous_chapters: false,
        background_colour: [0, 0, 0, 255],
        upscaler: None,
        socket_dir: None,
        shortcuts: Vec::new(),
    })
}

struct Viewer {
    commands: flume::Sender<UserCommand>,
    sizes: flume::Sender<ImageDimensions>,
    states: flume::Receiver<State>,
    _executables: flume::Sender<Executable>,
    manager: tokio::task::JoinHandle<aw_man_core::Result<()>>,
}

fn spawn_viewer(file: &Path, temp_root: &Path, modes: Modes) -> Viewer {
    let (command_tx, command_rx) = flume::bounded(8);
    let (executable_tx, executable_rx) = flume::bounded(1);
    let (size_tx, size_rx) = flume::bounded(4);
    let (state_tx, state_rx) = flume::bounded(0);
    let (_socket_tx, socket_rx) = flume::bounded(1);

    let manager = tokio::spawn(manager::run(ManagerOptions {
        files: vec![file.to_path_buf()],
        temp_root: temp_root.to_path_buf(),
        config: test_config(temp_root),
        modes,
        commands: command_rx,
        executables: executable_rx,
        sizes: size_rx,
        states: state_tx,
        sockets: socket_rx,
        upscale_jobs: None,
    }));

    Viewer {
        commands: command_tx,
        sizes: size_tx,
        states: state_rx,
        _executables: executable_tx,
        manager,
    }
}

async fn recv_until(states: &flume::Receiver<State>, pred: impl Fn(&State) -> bool) -> State {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let state = states.recv_async().await.expect("state channel open");
            if pred(&state) {
                return state;
            }
        }
    })
    .await
    .expect("expected state never arrived")
}

#[tokio::test(flavor = "multi_thread")]
async fn pages_load_and_navigate_through_the_window() {
    let fixture = TempDir::new().unwrap();
    let temp_root = TempDir::new().unwrap();
    let archive = fixture.path().join("series.zip");
    create_zip(&archive, 12, 1600, 1200);

    let viewer = spawn_viewer(&archive, temp_root.path(), Modes::default());
    viewer.sizes.send_async(ImageDimensions::new(800, 600)).await.unwrap();

    // The first page becomes displayable without any user input.
    let first = recv_until(&viewer.states, |s| s.page_number == 1 && s.image.is_some()).await;
    assert_eq!(first.archive_len, 12);
    assert_eq!(first.page_name, "001.png");
    assert_eq!(first.original_bounds, ImageDimensions::new(1600, 1200));

    // Rapid navigation: five NextPage presses land on page 6 (1-indexed).
    for _ in 0..5 {
        viewer
            .commands
            .send_async(UserCommand::fire_and_forget(Command::NextPage))
            .await
            .unwrap();
    }
    let sixth = recv_until(&viewer.states, |s| s.page_number == 6 && s.image.is_some()).await;
    assert_eq!(sixth.page_name, "006.png");

    // The displayed image eventually settles at the fit-into-box bounds.
    let fitted = recv_until(&viewer.states, |s| {
        s.page_number == 6
            && s.image
                .as_ref()
                .is_some_and(|img| img.dimensions() == ImageDimensions::new(800, 600))
    })
    .await;
    assert_eq!(fitted.original_bounds, ImageDimensions::new(1600, 1200));

    // Jumping beyond the end clamps to the last page.
    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::LastPage))
        .await
        .unwrap();
    let last = recv_until(&viewer.states, |s| s.page_number == 12).await;
    assert_eq!(last.page_name, "012.png");

    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::FirstPage))
        .await
        .unwrap();
    recv_until(&viewer.states, |s| s.page_number == 1 && s.image.is_some()).await;

    drop(viewer.manager);
}

#[tokio::test(flavor = "multi_thread")]
async fn next_archive_opens_the_fractional_successor() {
    let fixture = TempDir::new().unwrap();
    let temp_root = TempDir::new().unwrap();

    for name in ["Ch. 9.5.zip", "Ch. 10.zip", "Ch. 10.5.zip"] {
        create_zip(&fixture.path().join(name), 2, 64, 64);
    }

    let first = fixture.path().join("Ch. 9.5.zip");
    let viewer = spawn_viewer(&first, temp_root.path(), Modes::default());
    viewer.sizes.send_async(ImageDimensions::new(640, 480)).await.unwrap();

    let state = recv_until(&viewer.states, |s| s.page_number == 1 && s.image.is_some()).await;
    assert_eq!(state.archive_name, "Ch. 9.5.zip");

    // Ch. 10 follows Ch. 9.5, not Ch. 10.5.
    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::NextArchive))
        .await
        .unwrap();
    let state =
        recv_until(&viewer.states, |s| s.archive_name == "Ch. 10.zip" && s.image.is_some()).await;
    assert_eq!(state.page_number, 1);

    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::NextArchive))
        .await
        .unwrap();
    recv_until(&viewer.states, |s| s.archive_name == "Ch. 10.5.zip").await;

    drop(viewer.manager);
}

#[tokio::test(flavor = "multi_thread")]
async fn jump_moves_relative_and_absolute() {
    let fixture = TempDir::new().unwrap();
    let temp_root = TempDir::new().unwrap();
    let archive = fixture.path().join("series.zip");
    create_zip(&archive, 10, 64, 64);

    let viewer = spawn_viewer(&archive, temp_root.path(), Modes::default());
    viewer.sizes.send_async(ImageDimensions::new(640, 480)).await.unwrap();
    recv_until(&viewer.states, |s| s.page_number == 1 && s.image.is_some()).await;

    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::parse_action("jump 7").unwrap()))
        .await
        .unwrap();
    recv_until(&viewer.states, |s| s.page_number == 7).await;

    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::parse_action("jump -3").unwrap()))
        .await
        .unwrap();
    recv_until(&viewer.states, |s| s.page_number == 4).await;

    // Relative jumps clamp at the archive edge outside manga mode.
    viewer
        .commands
        .send_async(UserCommand::fire_and_forget(Command::parse_action("jump +99").unwrap()))
        .await
        .unwrap();
    recv_until(&viewer.states, |s| s.page_number == 10).await;

    drop(viewer.manager);
}
