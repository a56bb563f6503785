use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camera_streamer::buffer::{BufferAllocator, MEMFD_HEAP};
use camera_streamer::camera::{
    CaptureSession, Control, ControlId, SyntheticCamera, SyntheticCameraConfig, SyntheticHandle,
};
use camera_streamer::encoder::loopback::LOOPBACK_NAL_PREFIX;
use camera_streamer::encoder::EncoderOptions;
use camera_streamer::router::CAMERA_FAULT_MESSAGE;
use camera_streamer::{Command, CommandReader, Parameters, PipeWriter, Router};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    /// Every complete message written so far.
    fn messages(&self) -> Vec<Vec<u8>> {
        let bytes = self.0.lock().unwrap().clone();
        let mut reader = CommandReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(message) = reader.read_message().expect("well-formed pipe output") {
            out.push(message);
        }
        out
    }

    fn tagged(&self, tag: u8) -> Vec<Vec<u8>> {
        self.messages()
            .into_iter()
            .filter(|message| message.first() == Some(&tag))
            .collect()
    }
}

fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn small_params(depth: u32) -> Parameters {
    Parameters {
        width: 640,
        height: 480,
        buffer_count: depth,
        ..Parameters::default()
    }
}

fn manual_camera() -> (SyntheticCamera, SyntheticHandle) {
    let camera = SyntheticCamera::new(SyntheticCameraConfig {
        id: "stub://test".to_string(),
        fps: None,
        ..SyntheticCameraConfig::default()
    });
    let handle = camera.handle();
    (camera, handle)
}

fn stub_encoder() -> EncoderOptions {
    EncoderOptions {
        device: "stub://encoder".to_string(),
        ..EncoderOptions::default()
    }
}

fn start_router(params: Parameters) -> (Router, SyntheticHandle, SharedBuf) {
    let (camera, handle) = manual_camera();
    let allocator = BufferAllocator::open(&[MEMFD_HEAP]).expect("memfd allocator");
    let out = SharedBuf::default();
    let writer = Arc::new(PipeWriter::new(out.clone()));
    let router = Router::with_device(params, Box::new(camera), &allocator, &stub_encoder(), writer)
        .expect("router starts");
    (router, handle, out)
}

/// Complete one request once the camera holds the full pool again.
fn trigger_one(handle: &SyntheticHandle, depth: usize) {
    wait_until("pool to refill", || handle.queued() == depth);
    assert!(handle.trigger().expect("trigger"));
}

#[test]
fn request_pool_stays_at_configured_depth() {
    for depth in 1..=4usize {
        let params = small_params(depth as u32);
        let (camera, handle) = manual_camera();
        let allocator = BufferAllocator::open(&[MEMFD_HEAP]).expect("memfd allocator");
        let mut session =
            CaptureSession::create(&params, Box::new(camera), &allocator).expect("create session");

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            session.on_frame(move |frame| {
                let sequence = u64::from_le_bytes(frame.data[..8].try_into().unwrap());
                seen.lock().unwrap().push(sequence);
            });
        }
        session.start(&params).expect("start session");

        assert_eq!(session.request_count(), depth);
        assert_eq!(session.in_flight(), depth);
        assert_eq!(handle.queued(), depth);

        let frames = 3 * depth;
        for _ in 0..frames {
            trigger_one(&handle, depth);
            assert!(session.in_flight() <= depth);
        }
        wait_until("all frames", || session.frames_delivered() == frames as u64);
        wait_until("last requeue", || handle.queued() == depth);

        assert_eq!(session.request_count(), depth);
        assert_eq!(session.in_flight(), depth);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (1..=frames as u64).collect::<Vec<_>>());

        session.stop().expect("stop session");
    }
}

#[test]
fn cancelled_requests_report_a_single_fault() {
    let (router, handle, out) = start_router(small_params(4));
    trigger_one(&handle, 4);
    wait_until("first frame", || out.tagged(b'd').len() == 1);

    wait_until("pool to refill", || handle.queued() == 4);
    assert_eq!(handle.cancel_all().expect("cancel"), 4);
    wait_until("error state", || {
        router.session().map(|s| s.is_in_error()).unwrap_or(false)
    });
    std::thread::sleep(Duration::from_millis(50));

    let errors = out.tagged(b'e');
    assert_eq!(errors.len(), 1);
    assert_eq!(&errors[0][1..], CAMERA_FAULT_MESSAGE.as_bytes());

    // No request is resubmitted once the session is in error.
    assert_eq!(handle.queued(), 0);
    assert!(!handle.trigger().expect("trigger"));
    assert_eq!(router.session().map(|s| s.frames_delivered()), Some(1));

    router.stop().expect("stop router");
}

#[test]
fn reload_applies_controls_at_next_request() {
    let params = small_params(2);
    let (mut router, handle, _out) = start_router(params.clone());
    let initial = handle.applied().len();

    let mut reloaded = params.clone();
    reloaded.brightness = 0.25;
    reloaded.contrast = 1.5;
    let body = reloaded.serialize().into_bytes();

    assert!(router.handle(Command::Configure(body.clone())).expect("reload"));
    trigger_one(&handle, 2);
    wait_until("controls applied", || handle.applied().len() == initial + 1);
    let first = handle.applied()[initial].clone();
    assert_eq!(first.get(ControlId::Brightness), Some(&Control::Brightness(0.25)));
    assert_eq!(first.get(ControlId::Contrast), Some(&Control::Contrast(1.5)));
    let effective = handle.effective_controls();

    assert!(router.handle(Command::Configure(body)).expect("reload again"));
    trigger_one(&handle, 2);
    wait_until("controls applied", || handle.applied().len() == initial + 2);
    assert_eq!(handle.applied()[initial + 1], first);
    assert_eq!(handle.effective_controls(), effective);

    // A malformed snapshot leaves the previous one in place.
    assert!(router
        .handle(Command::Configure(b"Width:wide".to_vec()))
        .expect("bad reload is not fatal"));
    assert_eq!(router.params().brightness, 0.25);

    assert!(!router.handle(Command::Exit).expect("exit"));
    router.stop().expect("stop router");
}

#[test]
fn timestamps_survive_the_encoder() {
    let (router, handle, out) = start_router(small_params(3));
    for count in 1..=3 {
        trigger_one(&handle, 3);
        wait_until("encoded frame", || out.tagged(b'd').len() == count);
    }

    let mut last = None;
    for message in out.tagged(b'd') {
        let timestamp = u64::from_le_bytes(message[1..9].try_into().unwrap());
        let packet = &message[9..];
        assert_eq!(&packet[..5], &LOOPBACK_NAL_PREFIX[..]);
        let echoed = u64::from_le_bytes(packet[5..13].try_into().unwrap());
        assert_eq!(echoed, timestamp);
        if let Some(previous) = last {
            assert!(timestamp >= previous);
        }
        last = Some(timestamp);
    }

    router.stop().expect("stop router");
}

#[test]
fn secondary_stream_produces_jpeg_frames() {
    let params = Parameters {
        secondary_width: 160,
        secondary_height: 120,
        secondary_fps: 1000.0,
        ..small_params(2)
    };
    let (router, handle, out) = start_router(params);
    // Let one secondary interval elapse before the first completion.
    std::thread::sleep(Duration::from_millis(10));
    trigger_one(&handle, 2);
    wait_until("secondary frame", || !out.tagged(b's').is_empty());

    let message = &out.tagged(b's')[0];
    let jpeg = &message[9..];
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    router.stop().expect("stop router");
}

#[test]
fn text_overlay_keeps_frames_flowing() {
    let params = Parameters {
        text_overlay_enable: true,
        text_overlay: "cam %H:%M:%S.%f".to_string(),
        ..small_params(2)
    };
    let (router, handle, out) = start_router(params);
    for count in 1..=2 {
        trigger_one(&handle, 2);
        wait_until("encoded frame", || out.tagged(b'd').len() == count);
    }
    assert!(out.tagged(b'e').is_empty());
    router.stop().expect("stop router");
}
