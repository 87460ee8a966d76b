use anyhow::Context;
use bstr::{BString, ByteSlice};
use liblinescan::{Backend, FrameFormat, OptionId, OptionInfo, Parameters, Scanner};
use std::{collections::HashMap, io::Read, sync::Arc, thread};
use tokio::sync::{mpsc, oneshot};

pub enum ScanState {
    Prepare,
    Progress(f64),
    Done(Page),
    Error(anyhow::Error),
    Cancelled,
}

/// A scanned page as the device delivered it.
pub struct Page {
    pub bytes: Vec<u8>,
    pub format: FrameFormat,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

pub struct ScanJob {
    pub backend: Arc<Backend>,
    pub device: String,
    pub options: HashMap<BString, BString>,
}

pub fn start(job: ScanJob, mut cancel: oneshot::Receiver<()>) -> mpsc::Receiver<ScanState> {
    let (mut state_tx, state_rx) = mpsc::channel(4);

    let spawned = thread::Builder::new().name("scan".to_owned()).spawn(move || {
        match scan_page(job, &mut state_tx, &mut cancel) {
            Ok(Some(page)) => _ = state_tx.blocking_send(ScanState::Done(page)),
            Ok(None) => _ = state_tx.blocking_send(ScanState::Cancelled),
            Err(err) => _ = state_tx.blocking_send(ScanState::Error(err)),
        };
    });

    // The receiver then reports a closed channel.
    if let Err(err) = spawned {
        log::error!("Failed to spawn scan thread: {err}");
    }

    state_rx
}

fn scan_page(
    job: ScanJob,
    state: &mut mpsc::Sender<ScanState>,
    cancel: &mut oneshot::Receiver<()>,
) -> anyhow::Result<Option<Page>> {
    macro_rules! send_state {
        ($state:expr) => {
            if state.blocking_send($state).is_err() {
                log::debug!("State sender was dropped");
                return Ok(None);
            }
        };
    }
    macro_rules! check_cancellation {
        ($channel:expr) => {
            match $channel.try_recv() {
                Ok(()) => {
                    log::debug!("Scan cancelled");
                    return Ok(None);
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    log::debug!("Cancel sender was dropped");
                    return Ok(None);
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        };
    }

    send_state!(ScanState::Prepare);

    let device_name = &job.device;
    log::debug!("Use scanner '{device_name}'");

    check_cancellation!(cancel);
    let mut scanner = job
        .backend
        .open(device_name)
        .with_context(|| format!("opening device '{device_name}'"))?;

    setup_scanner(&mut scanner, &job.options);

    check_cancellation!(cancel);
    let mut reader = scanner.start().context("starting scan")?;

    let parameters = reader.get_parameters().context("getting parameters")?;
    log::debug!("Start scan with parameters {parameters:?}");

    let page_size = parameters.bytes_per_line * parameters.lines;
    let mut page = vec![0u8; page_size];
    let mut page_offset = 0;

    send_state!(ScanState::Progress(0.0));

    let mut previous_progress = 0.0;
    while page_offset < page_size {
        const WINDOW_SIZE: usize = 128 * 1024;

        check_cancellation!(cancel);

        let window_end = (page_offset + WINDOW_SIZE).min(page_size);
        let read = reader
            .read(&mut page[page_offset..window_end])
            .context("reading from scanner")?;
        if read == 0 {
            break;
        }
        page_offset += read;

        let progress = page_offset as f64 / page_size as f64 * 100.;
        log::trace!("Scan progress {page_offset} of {page_size} bytes ({progress:.1}%)");

        if progress - previous_progress >= 5.0 {
            send_state!(ScanState::Progress(progress));
            previous_progress = progress;
        }
    }

    if page_offset < page_size {
        log::warn!("Scan ended after {page_offset} of {page_size} bytes");
        page.truncate(page_offset - page_offset % parameters.bytes_per_line.max(1));
    }

    send_state!(ScanState::Progress(100.0));
    log::debug!("Scan done");

    Ok(Some(into_page(parameters, page)))
}

fn setup_scanner(scanner: &mut Scanner, options: &HashMap<BString, BString>) {
    let device_name = scanner.get_device().name.to_string();
    if options.is_empty() {
        log::debug!("No custom options for device '{device_name}'. Use default values");
        return;
    }

    // Mode and source change which other options are active, so they go first.
    let mut ordered: Vec<_> = options.iter().collect();
    ordered.sort_by_key(|(name, _)| match name.as_bytes() {
        b"source" => 0,
        b"mode" => 1,
        _ => 2,
    });

    for (name, value) in ordered {
        match scanner.set_option_text(name, value.as_bstr()) {
            Ok(info) if info.contains(OptionInfo::INEXACT) => {
                match OptionId::find(name).map(|id| scanner.get_option(id)) {
                    Some(Ok(actual)) => log::warn!("Option '{name}' set to '{actual}' instead of '{value}'"),
                    _ => log::warn!("Option '{name}' set inexactly from '{value}'"),
                }
            }
            Ok(_) => log::debug!("Successfully set value '{value}' for option '{name}'"),
            Err(err) => log::warn!("Failed to set '{value}' value for option '{name}': {err}"),
        }
    }
}

fn into_page(parameters: Parameters, bytes: Vec<u8>) -> Page {
    Page {
        height: bytes.len() / parameters.bytes_per_line.max(1),
        bytes,
        format: parameters.format,
        width: parameters.pixels_per_line,
        depth: parameters.depth,
    }
}
