use liblinescan::{
    geometry::{plan, ScanMode, ScanRequest},
    profile::{find_model, known_models, ColorOrdering, DeviceProfile},
    protocol::ExposureParameters,
    sim::{SimConfig, SimProbe, SimulatedScanner},
    store::CalibrationStore,
    Backend, Channel, Fixed, FrameFormat, OptionId, OptionValue, SaneError, Scanner, Scheduler,
};
use std::{
    io::Read,
    thread,
    time::{Duration, Instant},
};

const DEVICE: &str = "sim:0";

fn quick(mut profile: DeviceProfile) -> DeviceProfile {
    profile.timing.poll_interval = Duration::from_millis(1);
    profile.timing.cancel_timeout = Duration::from_secs(5);
    profile
}

fn narrow(mut profile: DeviceProfile, sensor_pixels: u32) -> DeviceProfile {
    profile.sensor_pixels = sensor_pixels;
    profile
}

fn attach_with(profile: DeviceProfile, config: SimConfig, scheduler: Scheduler) -> (Backend, SimProbe) {
    let sim = SimulatedScanner::new(config);
    let probe = sim.probe();

    let mut backend = Backend::new().with_store(None).with_scheduler(scheduler);
    backend.attach(DEVICE, profile, sim.opener());

    (backend, probe)
}

fn attach(profile: DeviceProfile) -> (Backend, SimProbe) {
    let config = SimConfig::for_profile(&profile);
    attach_with(profile, config, Scheduler::Thread)
}

fn set(scanner: &mut Scanner, name: &str, text: &str) {
    scanner.set_option_text(name, text.into()).unwrap();
}

fn window(scanner: &mut Scanner, br_x: &str, br_y: &str) {
    set(scanner, "tl-x", "0");
    set(scanner, "tl-y", "0");
    set(scanner, "br-x", br_x);
    set(scanner, "br-y", br_y);
}

fn read_page(scanner: &mut Scanner) -> Result<Vec<u8>, SaneError> {
    let mut page = Vec::new();
    let mut buf = vec![0; 3000];

    loop {
        match scanner.read(&mut buf) {
            Ok(count) => page.extend_from_slice(&buf[..count]),
            Err(SaneError::EOF) => return Ok(page),
            Err(err) => return Err(err),
        }
    }
}

fn scan(scanner: &mut Scanner) -> Vec<u8> {
    scanner.start_scan().unwrap();
    read_page(scanner).unwrap()
}

#[test]
fn gray_100dpi_full_flatbed() {
    let (backend, probe) = attach(quick(find_model("artec-eplus48u").unwrap()));
    let mut scanner = backend.open(DEVICE).unwrap();

    set(&mut scanner, "mode", "Gray");
    set(&mut scanner, "resolution", "100");
    set(&mut scanner, "depth", "8");

    let params = scanner.get_parameters().unwrap();
    assert_eq!(params.format, FrameFormat::Gray);
    assert_eq!(params.depth, 8);
    assert_eq!(params.pixels_per_line, 850);
    assert_eq!(params.bytes_per_line, params.pixels_per_line);

    let page = scan(&mut scanner);
    assert_eq!(page.len(), params.lines * params.bytes_per_line);
    assert!(!scanner.is_scanning());
    assert!(scanner.is_calibrated());
    assert!(probe.is_homed());
    assert!(!probe.is_scanning());

    // a second page reuses the calibration
    let started = probe.scans_started();
    assert_eq!(scan(&mut scanner).len(), page.len());
    assert_eq!(probe.scans_started(), started + 1);
}

#[test]
fn planner_alignment_and_idempotence() {
    for profile in known_models() {
        for &dpi in &profile.resolutions {
            for (mode, depth) in [
                (ScanMode::Lineart, 8),
                (ScanMode::Gray, 8),
                (ScanMode::Color, 8),
                (ScanMode::Color, 16),
            ] {
                let Some(area) = profile.area(profile.sources().next().unwrap()).copied() else {
                    continue;
                };
                let request = ScanRequest {
                    tl_x: Fixed::from_int(0),
                    tl_y: Fixed::from_int(0),
                    br_x: area.width,
                    br_y: area.height,
                    xdpi: dpi,
                    ydpi: dpi,
                    mode,
                    depth,
                    source: profile.sources().next().unwrap(),
                    negative: false,
                };

                let Ok(params) = plan(&request, profile) else {
                    continue;
                };
                assert_eq!(plan(&request, profile), Ok(params.clone()));
                assert_eq!(params.scan_bpl % profile.alignment, 0, "{} at {dpi}", profile.key);
                assert!(params.pixel_xs <= params.scan_xs);
                assert!(params.abs_x0 + params.pixel_xs * profile.optical_xdpi / params.xdpi <= profile.sensor_pixels);
            }
        }
    }
}

#[test]
fn calibration_matches_sensor_response() {
    let profile = quick(narrow(find_model("artec-eplus48u").unwrap(), 1024));
    let config = SimConfig::for_profile(&profile);
    let black_exposure = ExposureParameters::uniform(profile.calibration.black_exposure);
    let (backend, probe) = attach_with(profile, config.clone(), Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    window(&mut scanner, "5", "5");
    scan(&mut scanner);

    let tables = scanner.calibration().unwrap().clone();
    assert_eq!(tables.pixels(), 1024);
    assert_eq!(probe.afe(), tables.afe);
    assert_eq!(probe.exposure(), tables.exposure);

    for channel in Channel::ALL {
        let c = channel.index();
        for x in (0..1024).step_by(37) {
            let black = config.level(channel, x as u32, 0, &black_exposure, &tables.afe);
            let white = config.level(channel, x as u32, 0, &tables.exposure, &tables.afe);
            assert!((tables.black[c][x] as f64 - black).abs() < 300.0, "black {channel} {x}");
            assert!((tables.white[c][x] as f64 - white).abs() < 300.0, "white {channel} {x}");
        }
    }
}

#[test]
fn white_search_from_outside_band_converges() {
    let original = quick(narrow(find_model("artec-eplus48u").unwrap(), 1024));
    let config = SimConfig::for_profile(&original);

    let mut profile = original.clone();
    profile.default_exposure = ExposureParameters::uniform(100);
    let tuning = profile.calibration;
    let (backend, _probe) = attach_with(profile, config, Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    window(&mut scanner, "5", "5");
    scan(&mut scanner);

    let tables = scanner.calibration().unwrap();
    assert_ne!(tables.exposure, ExposureParameters::uniform(100));
    for white in &tables.white {
        let brightest = *white.iter().max().unwrap() as u32;
        assert!(
            (tuning.white_min..=tuning.white_max).contains(&brightest),
            "{brightest} outside the band"
        );
    }
}

#[test]
fn calibration_gives_up_after_round_limit() {
    let original = quick(narrow(find_model("artec-eplus48u").unwrap(), 512));
    let config = SimConfig::for_profile(&original);

    let mut profile = original.clone();
    profile.default_exposure = ExposureParameters::uniform(100);
    profile.calibration.max_rounds = 1;
    let (backend, probe) = attach_with(profile, config, Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "5", "5");

    let params = scanner.get_parameters().unwrap();
    let page = scan(&mut scanner);
    assert_eq!(page.len(), params.lines * params.bytes_per_line);
    assert_ne!(probe.exposure(), ExposureParameters::uniform(100));
}

fn ccd_page(distance: u32, arrangement: u8, ordering: Option<ColorOrdering>) -> Vec<u8> {
    let mut profile = quick(narrow(find_model("umax-astra-ccd").unwrap(), 640));
    profile.ordering = ordering.unwrap_or(ColorOrdering::LineCcd {
        distance,
        arrangement,
    });
    let (backend, _probe) = attach(profile);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Color");
    set(&mut scanner, "resolution", "600");
    set(&mut scanner, "tl-x", "2");
    set(&mut scanner, "tl-y", "3");
    set(&mut scanner, "br-x", "20");
    set(&mut scanner, "br-y", "9");

    let params = scanner.get_parameters().unwrap();
    let page = scan(&mut scanner);
    assert_eq!(page.len(), params.lines * params.bytes_per_line);
    page
}

#[test]
fn ccd_reordering_matches_pixel_ordered_device() {
    let reference = ccd_page(0, 1, Some(ColorOrdering::Pixel));

    for distance in [0, 1, 4, 16] {
        for arrangement in [1, 2, 4, 32, 33] {
            assert!(
                ccd_page(distance, arrangement, None) == reference,
                "distance {distance}, arrangement {arrangement}"
            );
        }
    }
}

#[test]
fn ccd_downsampling_delivers_requested_lines() {
    let (backend, _probe) = attach(quick(narrow(find_model("umax-astra-ccd").unwrap(), 640)));
    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Color");
    set(&mut scanner, "resolution", "150");
    window(&mut scanner, "20", "30");

    let params = scanner.get_parameters().unwrap();
    // 30 mm at 150 dpi is 177.2 lines
    assert!((177..=178).contains(&params.lines), "{} lines", params.lines);
    assert_eq!(scan(&mut scanner).len(), params.lines * params.bytes_per_line);
}

#[test]
fn horizontal_interpolation_averages_neighbours() {
    let (backend, _probe) = attach(quick(narrow(find_model("artec-eplus48u").unwrap(), 1024)));
    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    set(&mut scanner, "resolution", "1200");
    window(&mut scanner, "30", "1");

    let params = scanner.get_parameters().unwrap();
    assert_eq!(params.pixels_per_line % 2, 0);
    let page = scan(&mut scanner);

    for line in page.chunks_exact(params.bytes_per_line) {
        for i in (1..line.len() - 1).step_by(2) {
            let expected = (line[i - 1] as i32 + line[i + 1] as i32) / 2;
            assert!((line[i] as i32 - expected).abs() <= 1, "pixel {i}");
        }
        assert_eq!(line[line.len() - 1], line[line.len() - 2]);
    }
}

#[test]
fn vertical_interpolation_doubles_lines() {
    let (backend, _probe) = attach(quick(find_model("generic-cis").unwrap()));
    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    set(&mut scanner, "resolution", "600");
    window(&mut scanner, "10", "10");

    let params = scanner.get_parameters().unwrap();
    assert_eq!(params.lines % 2, 0);
    let page = scan(&mut scanner);
    let lines: Vec<&[u8]> = page.chunks_exact(params.bytes_per_line).collect();
    assert_eq!(lines.len(), params.lines);

    for pair in (1..lines.len() - 1).step_by(2) {
        for x in 0..params.bytes_per_line {
            let expected = (lines[pair - 1][x] as i32 + lines[pair + 1][x] as i32) / 2;
            assert!((lines[pair][x] as i32 - expected).abs() <= 1, "line {pair}, pixel {x}");
        }
    }
    assert_eq!(lines[lines.len() - 1], lines[lines.len() - 2]);
}

#[test]
fn cancel_mid_scan_parks_device() {
    let profile = quick(narrow(find_model("artec-eplus48u").unwrap(), 512));
    let mut config = SimConfig::for_profile(&profile);
    let (backend, probe) = attach_with(profile, config.clone(), Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "200");
    scan(&mut scanner);

    config.line_delay = Duration::from_millis(2);
    probe.set_config(config);

    scanner.start_scan().unwrap();
    let mut buf = [0; 64];
    scanner.read(&mut buf).unwrap();
    assert!(scanner.is_scanning());
    assert!(probe.is_scanning());
    assert_eq!(
        scanner.set_option(OptionId::Resolution, OptionValue::Int(600)),
        Err(SaneError::DeviceBusy)
    );
    assert_eq!(scanner.start_scan(), Err(SaneError::DeviceBusy));

    scanner.cancel();
    assert!(!scanner.is_scanning());
    assert_eq!(scanner.lines_remaining(), None);
    assert_eq!(scanner.read(&mut buf), Err(SaneError::Inval));
    assert!(probe.is_homed());
    assert!(!probe.is_scanning());

    // dropping a page reader cancels as well
    {
        let mut page = scanner.start().unwrap();
        page.read_exact(&mut buf).unwrap();
    }
    assert!(!scanner.is_scanning());
    assert!(probe.is_homed());
}

#[test]
fn tokio_scheduler_delivers_same_page() {
    let profile = quick(narrow(find_model("generic-cis").unwrap(), 640));
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let mut pages = Vec::new();
    for scheduler in [Scheduler::Thread, Scheduler::Tokio(runtime.handle().clone())] {
        let config = SimConfig::for_profile(&profile);
        let (backend, _probe) = attach_with(profile.clone(), config, scheduler);
        let mut scanner = backend.open(DEVICE).unwrap();
        set(&mut scanner, "mode", "Color");
        set(&mut scanner, "resolution", "150");
        window(&mut scanner, "30", "20");

        let mut page = Vec::new();
        scanner.start().unwrap().read_to_end(&mut page).unwrap();
        pages.push(page);
    }

    assert!(!pages[0].is_empty());
    assert!(pages[0] == pages[1]);
}

#[test]
fn non_blocking_reads_until_eof() {
    let profile = quick(narrow(find_model("generic-cis").unwrap(), 640));
    let mut config = SimConfig::for_profile(&profile);
    config.line_delay = Duration::from_millis(1);
    let (backend, _probe) = attach_with(profile, config, Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "10");
    assert_eq!(scanner.set_io_mode(true), Err(SaneError::Inval));
    assert_eq!(scanner.get_select_fd(), Err(SaneError::Unsupported));

    let params = scanner.get_parameters().unwrap();
    scanner.start_scan().unwrap();
    scanner.set_io_mode(true).unwrap();

    let mut total = 0;
    let mut buf = [0; 512];
    loop {
        match scanner.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(1)),
            Ok(count) => total += count,
            Err(SaneError::EOF) => break,
            Err(err) => panic!("read failed: {err}"),
        }
    }
    assert_eq!(total, params.lines * params.bytes_per_line);
}

#[test]
fn transport_failure_surfaces_once() {
    let profile = quick(narrow(find_model("generic-cis").unwrap(), 640));
    let mut config = SimConfig::for_profile(&profile);
    let (backend, probe) = attach_with(profile, config.clone(), Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "40");
    scan(&mut scanner);

    config.fail_after_lines = Some(probe.lines_served() + 5);
    probe.set_config(config);

    scanner.start_scan().unwrap();
    assert_eq!(read_page(&mut scanner), Err(SaneError::IO));
    let mut buf = [0; 16];
    assert_eq!(scanner.read(&mut buf), Err(SaneError::EOF));
    assert!(!scanner.is_scanning());
    assert!(probe.is_homed());
}

#[test]
fn sessions_are_exclusive() {
    let (backend, _probe) = attach(quick(find_model("generic-cis").unwrap()));

    let first = backend.open(DEVICE).unwrap();
    assert_eq!(backend.open(DEVICE).err(), Some(SaneError::DeviceBusy));
    drop(first);
    assert!(backend.open(DEVICE).is_ok());

    assert_eq!(backend.open("missing").err(), Some(SaneError::Inval));
    assert_eq!(backend.get_all_devices().len(), 1);
    assert_eq!(
        backend.find_device_by_name(DEVICE).unwrap().to_string(),
        "'sim:0' (vendor 'Generic', model 'CIS 300', type 'sheetfed scanner')"
    );
}

#[test]
fn calibration_persists_between_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let profile = quick(narrow(find_model("generic-cis").unwrap(), 640));
    let sim = SimulatedScanner::new(SimConfig::for_profile(&profile));
    let probe = sim.probe();

    let mut backend = Backend::new()
        .with_store(Some(CalibrationStore::new(dir.path())))
        .with_scheduler(Scheduler::Thread);
    backend.attach(DEVICE, profile.clone(), sim.opener());

    let calibration = {
        let mut scanner = backend.open(DEVICE).unwrap();
        assert!(!scanner.is_calibrated());
        set(&mut scanner, "mode", "Gray");
        window(&mut scanner, "10", "10");
        scan(&mut scanner);
        scanner.calibration().unwrap().clone()
    };

    let mut scanner = backend.open(DEVICE).unwrap();
    assert_eq!(scanner.calibration(), Some(&calibration));

    let started = probe.scans_started();
    window(&mut scanner, "10", "10");
    scan(&mut scanner);
    assert_eq!(probe.scans_started(), started + 1);

    // forcing calibration runs the sub-scans again
    scanner.set_option(OptionId::Calibrate, OptionValue::Bool(true)).unwrap();
    scan(&mut scanner);
    assert!(probe.scans_started() > started + 2);

    let store = CalibrationStore::new(dir.path());
    store.remove(&profile.identity()).unwrap();
    drop(scanner);
    assert!(!backend.open(DEVICE).unwrap().is_calibrated());
}

/// Artec profile whose cancel gives up long before a slow line arrives.
fn impatient() -> DeviceProfile {
    let mut profile = quick(narrow(find_model("artec-eplus48u").unwrap(), 512));
    profile.timing.cancel_timeout = Duration::from_millis(50);
    profile
}

fn until_idle<T>(mut attempt: impl FnMut() -> Result<T, SaneError>) -> T {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match attempt() {
            Err(SaneError::DeviceBusy) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            result => return result.unwrap(),
        }
    }
}

/// Starts a scan on a device answering every line late, then cancels it
/// before the reader task can stop.
fn cancel_slow_scan(scanner: &mut Scanner, probe: &SimProbe) {
    let mut config = probe.config();
    config.line_delay = Duration::from_millis(400);
    probe.set_config(config);

    until_idle(|| scanner.start_scan());
    let mut buf = [0; 64];
    scanner.read(&mut buf).unwrap();
    // let the reader task block on the next line
    thread::sleep(Duration::from_millis(100));

    scanner.cancel();
    assert!(!scanner.is_scanning());
    assert!(probe.is_scanning());

    let mut config = probe.config();
    config.line_delay = Duration::ZERO;
    probe.set_config(config);
}

#[test]
fn rescan_waits_for_detached_reader() {
    let profile = impatient();
    let config = SimConfig::for_profile(&profile);
    let (backend, probe) = attach_with(profile, config, Scheduler::Thread);

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "60");
    until_idle(|| scanner.start_scan());
    let expected = read_page(&mut scanner).unwrap();

    cancel_slow_scan(&mut scanner, &probe);
    assert_eq!(scanner.start_scan(), Err(SaneError::DeviceBusy));

    until_idle(|| scanner.start_scan());
    assert_eq!(read_page(&mut scanner).unwrap(), expected);
    assert_eq!(probe.transports_opened(), 1);

    scanner.cancel();
    assert!(probe.is_homed());
}

#[test]
fn closing_during_detached_cancel_keeps_device_locked() {
    let dir = tempfile::tempdir().unwrap();
    let profile = impatient();
    let sim = SimulatedScanner::new(SimConfig::for_profile(&profile));
    let probe = sim.probe();

    let mut backend = Backend::new()
        .with_store(Some(CalibrationStore::new(dir.path())))
        .with_scheduler(Scheduler::Thread);
    backend.attach(DEVICE, profile, sim.opener());

    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "60");
    until_idle(|| scanner.start_scan());
    let expected = read_page(&mut scanner).unwrap();

    cancel_slow_scan(&mut scanner, &probe);
    drop(scanner);
    assert_eq!(backend.open(DEVICE).err(), Some(SaneError::DeviceBusy));

    let mut scanner = until_idle(|| backend.open(DEVICE));
    assert!(probe.is_homed());
    assert_eq!(probe.transports_opened(), 1);

    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "60");
    until_idle(|| scanner.start_scan());
    assert_eq!(read_page(&mut scanner).unwrap(), expected);
}

#[test]
fn reader_spawn_failure_parks_and_keeps_transport() {
    let profile = quick(narrow(find_model("generic-cis").unwrap(), 640));
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let handle = runtime.handle().clone();
    drop(runtime);

    let config = SimConfig::for_profile(&profile);
    let (backend, probe) = attach_with(profile, config, Scheduler::Tokio(handle));
    let mut scanner = backend.open(DEVICE).unwrap();
    set(&mut scanner, "mode", "Gray");
    window(&mut scanner, "20", "20");

    assert_eq!(scanner.start_scan(), Err(SaneError::IO));
    assert!(!scanner.is_scanning());
    assert!(probe.is_homed());
    let started = probe.scans_started();
    assert!(started > 0);

    // the parked transport is reused rather than reopened
    assert_eq!(scanner.start_scan(), Err(SaneError::IO));
    assert!(probe.scans_started() > started);
    assert!(probe.is_homed());
    assert_eq!(probe.transports_opened(), 1);
}
