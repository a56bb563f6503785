//! Software H.264 backend.
//!
//! `encode` copies each frame into a single-slot mailbox and returns; a
//! worker thread takes it, compresses it under the codec lock and hands the
//! packets to the output callback. A producer that outruns the worker waits
//! on the mailbox instead of dropping frames.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::codec::{CodecFactory, CodecSettings, H264Codec};
use super::OutputCallback;
use crate::camera::ColorSpace;
use crate::mailbox::Mailbox;
use crate::params::Parameters;

struct PendingFrame {
    data: Vec<u8>,
    timestamp_us: u64,
}

pub struct SoftwareEncoder {
    codec: Arc<Mutex<Box<dyn H264Codec>>>,
    mailbox: Arc<Mailbox<PendingFrame>>,
    spare: Arc<Mutex<Vec<Vec<u8>>>>,
    frame_size: usize,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwareEncoder {
    /// Open a codec through `factory` and start the worker.
    ///
    /// Input rows must be tightly packed: a `stride` other than the frame
    /// width is rejected before anything is allocated.
    pub fn create(
        params: &Parameters,
        stride: u32,
        colorspace: ColorSpace,
        factory: CodecFactory,
        output: OutputCallback,
    ) -> Result<Self> {
        if stride != params.width {
            bail!(
                "unsupported stride: expected {}, got {}",
                params.width,
                stride
            );
        }
        let settings = CodecSettings::from_params(params, colorspace);
        let codec = Arc::new(Mutex::new(
            factory(&settings).context("open software H.264 codec")?,
        ));
        let mailbox = Arc::new(Mailbox::new());
        let spare = Arc::new(Mutex::new(Vec::new()));

        let worker = EncodeWorker {
            codec: Arc::clone(&codec),
            mailbox: Arc::clone(&mailbox),
            spare: Arc::clone(&spare),
            output,
        };
        let join = std::thread::Builder::new()
            .name("h264-software".to_string())
            .spawn(move || worker.run())
            .context("spawn software encoder thread")?;

        log::info!(
            "SoftwareEncoder: encoding {}x{} @ {} fps, {} bps, profile {} level {}",
            settings.width,
            settings.height,
            settings.fps,
            settings.bitrate,
            settings.profile,
            settings.level
        );
        Ok(Self {
            codec,
            mailbox,
            spare,
            frame_size: settings.frame_size(),
            join: Mutex::new(Some(join)),
        })
    }

    /// Copy `data` into the mailbox, waiting while the previous frame is
    /// still there. Called from the capture completion thread.
    pub fn encode(&self, data: &[u8], timestamp_us: u64) -> Result<()> {
        let len = self.frame_size.min(data.len());
        let mut buffer = self
            .spare
            .lock()
            .map_err(|_| anyhow!("frame pool lock poisoned"))?
            .pop()
            .unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(&data[..len]);
        self.mailbox.put(PendingFrame {
            data: buffer,
            timestamp_us,
        })
    }

    pub fn reload_params(&self, params: &Parameters) {
        let result = self
            .codec
            .lock()
            .map_err(|_| anyhow!("codec lock poisoned"))
            .and_then(|mut codec| codec.reconfigure(params.bitrate, params.idr_period));
        match result {
            Ok(()) => log::debug!(
                "SoftwareEncoder: reconfigured to {} bps, IDR every {}",
                params.bitrate,
                params.idr_period
            ),
            Err(err) => log::error!("SoftwareEncoder: reconfigure failed: {:#}", err),
        }
    }

    /// Encode what is already in the mailbox, then join the worker.
    pub fn stop(&self) -> Result<()> {
        self.mailbox.close();
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("encoder join lock poisoned"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("software encoder thread panicked"))?;
            log::info!("SoftwareEncoder: stopped");
        }
        Ok(())
    }
}

impl Drop for SoftwareEncoder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("SoftwareEncoder: shutdown failed: {}", err);
        }
    }
}

struct EncodeWorker {
    codec: Arc<Mutex<Box<dyn H264Codec>>>,
    mailbox: Arc<Mailbox<PendingFrame>>,
    spare: Arc<Mutex<Vec<Vec<u8>>>>,
    output: OutputCallback,
}

impl EncodeWorker {
    fn run(self) {
        let _closed = self.mailbox.close_on_drop();
        let mut pts: i64 = 0;
        while let Some(frame) = self.mailbox.take() {
            let output = &self.output;
            let timestamp_us = frame.timestamp_us;
            let result = match self.codec.lock() {
                Ok(mut codec) => codec.encode(&frame.data, pts, &mut |packet| {
                    output(packet, timestamp_us)
                }),
                Err(_) => Err(anyhow!("codec lock poisoned")),
            };
            if let Err(err) = result {
                log::error!("SoftwareEncoder: frame {} not encoded: {:#}", pts, err);
            }
            pts += 1;
            if let Ok(mut spare) = self.spare.lock() {
                spare.push(frame.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    static FACTORY_CALLED: AtomicBool = AtomicBool::new(false);

    struct RecordingCodec {
        gate: Option<Arc<Mutex<()>>>,
    }

    impl H264Codec for RecordingCodec {
        fn encode(&mut self, frame: &[u8], pts: i64, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
            if let Some(gate) = &self.gate {
                let _held = gate.lock().map_err(|_| anyhow!("gate poisoned"))?;
            }
            let mut packet = pts.to_le_bytes().to_vec();
            packet.extend_from_slice(&frame[..4.min(frame.len())]);
            sink(&packet);
            Ok(())
        }

        fn reconfigure(&mut self, _bitrate: u32, _idr_period: u32) -> Result<()> {
            Ok(())
        }
    }

    /// Rate control only; rejects GOP changes as an encoder that cannot
    /// reopen would.
    struct FixedGopCodec {
        idr_period: u32,
        bitrate: Arc<Mutex<u32>>,
    }

    impl H264Codec for FixedGopCodec {
        fn encode(&mut self, _frame: &[u8], pts: i64, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
            sink(&pts.to_le_bytes());
            Ok(())
        }

        fn reconfigure(&mut self, bitrate: u32, idr_period: u32) -> Result<()> {
            if idr_period != self.idr_period {
                bail!("IDR period is fixed at {}", self.idr_period);
            }
            *self.bitrate.lock().map_err(|_| anyhow!("bitrate poisoned"))? = bitrate;
            Ok(())
        }
    }

    struct PanickingCodec;

    impl H264Codec for PanickingCodec {
        fn encode(&mut self, _frame: &[u8], _pts: i64, _sink: &mut dyn FnMut(&[u8])) -> Result<()> {
            panic!("codec crashed");
        }

        fn reconfigure(&mut self, _bitrate: u32, _idr_period: u32) -> Result<()> {
            Ok(())
        }
    }

    fn panicking_codec(_settings: &CodecSettings) -> Result<Box<dyn H264Codec>> {
        Ok(Box::new(PanickingCodec))
    }

    fn recording_codec(_settings: &CodecSettings) -> Result<Box<dyn H264Codec>> {
        Ok(Box::new(RecordingCodec { gate: None }))
    }

    fn flagging_codec(_settings: &CodecSettings) -> Result<Box<dyn H264Codec>> {
        FACTORY_CALLED.store(true, Ordering::SeqCst);
        Ok(Box::new(RecordingCodec { gate: None }))
    }

    fn channel_output() -> (OutputCallback, mpsc::Receiver<(Vec<u8>, u64)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let output: OutputCallback = Arc::new(move |data: &[u8], ts: u64| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send((data.to_vec(), ts));
            }
        });
        (output, rx)
    }

    fn params() -> Parameters {
        Parameters {
            width: 16,
            height: 8,
            ..Parameters::default()
        }
    }

    #[test]
    fn stride_mismatch_fails_before_opening_codec() {
        let (output, _rx) = channel_output();
        let err = SoftwareEncoder::create(
            &params(),
            32,
            ColorSpace::Smpte170m,
            flagging_codec,
            output,
        )
        .err()
        .expect("stride mismatch rejected");
        assert_eq!(err.to_string(), "unsupported stride: expected 16, got 32");
        assert!(!FACTORY_CALLED.load(Ordering::SeqCst));
    }

    #[test]
    fn frames_are_encoded_in_order_with_caller_timestamps() -> Result<()> {
        let (output, rx) = channel_output();
        let encoder =
            SoftwareEncoder::create(&params(), 16, ColorSpace::Smpte170m, recording_codec, output)?;
        let frame = vec![7u8; 16 * 8 * 3 / 2];
        for ts in [1_000u64, 34_333, 67_666] {
            encoder.encode(&frame, ts)?;
        }
        encoder.stop()?;

        let packets: Vec<(Vec<u8>, u64)> = rx.try_iter().collect();
        assert_eq!(packets.len(), 3);
        for (index, (packet, ts)) in packets.iter().enumerate() {
            let pts = i64::from_le_bytes(packet[..8].try_into()?);
            assert_eq!(pts, index as i64);
            assert_eq!(&packet[8..], &[7, 7, 7, 7]);
            assert_eq!(*ts, [1_000u64, 34_333, 67_666][index]);
        }
        Ok(())
    }

    #[test]
    fn rejected_reconfigure_keeps_encoding() -> Result<()> {
        let bitrate = Arc::new(Mutex::new(0));
        let codec: Box<dyn H264Codec> = Box::new(FixedGopCodec {
            idr_period: 30,
            bitrate: Arc::clone(&bitrate),
        });
        let (output, rx) = channel_output();
        let mailbox = Arc::new(Mailbox::new());
        let codec = Arc::new(Mutex::new(codec));
        let worker = EncodeWorker {
            codec: Arc::clone(&codec),
            mailbox: Arc::clone(&mailbox),
            spare: Arc::new(Mutex::new(Vec::new())),
            output,
        };
        let encoder = SoftwareEncoder {
            codec,
            mailbox,
            spare: Arc::new(Mutex::new(Vec::new())),
            frame_size: 16 * 8 * 3 / 2,
            join: Mutex::new(Some(std::thread::spawn(move || worker.run()))),
        };

        encoder.reload_params(&Parameters {
            bitrate: 2_000_000,
            idr_period: 30,
            ..params()
        });
        assert_eq!(*bitrate.lock().map_err(|_| anyhow!("bitrate poisoned"))?, 2_000_000);

        encoder.reload_params(&Parameters {
            bitrate: 3_000_000,
            idr_period: 10,
            ..params()
        });
        assert_eq!(*bitrate.lock().map_err(|_| anyhow!("bitrate poisoned"))?, 2_000_000);

        let frame = vec![0u8; 16 * 8 * 3 / 2];
        encoder.encode(&frame, 5)?;
        let (_, ts) = rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(ts, 5);
        encoder.stop()?;
        Ok(())
    }

    #[test]
    fn crashed_worker_fails_later_frames() -> Result<()> {
        let (output, _rx) = channel_output();
        let encoder =
            SoftwareEncoder::create(&params(), 16, ColorSpace::Smpte170m, panicking_codec, output)?;
        let frame = vec![0u8; 16 * 8 * 3 / 2];
        encoder.encode(&frame, 1)?;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while encoder.encode(&frame, 2).is_ok() {
            assert!(std::time::Instant::now() < deadline, "producer never released");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(encoder.stop().is_err());
        Ok(())
    }

    #[test]
    fn busy_worker_blocks_producer_without_dropping() -> Result<()> {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().map_err(|_| anyhow!("gate poisoned"))?;
        let (output, rx) = channel_output();
        let codec: Box<dyn H264Codec> = Box::new(RecordingCodec {
            gate: Some(Arc::clone(&gate)),
        });
        let codec = Arc::new(Mutex::new(codec));
        let mailbox = Arc::new(Mailbox::new());
        let encoder = Arc::new(SoftwareEncoder {
            codec: Arc::clone(&codec),
            mailbox: Arc::clone(&mailbox),
            spare: Arc::new(Mutex::new(Vec::new())),
            frame_size: 16 * 8 * 3 / 2,
            join: Mutex::new(None),
        });
        let worker = EncodeWorker {
            codec,
            mailbox: Arc::clone(&mailbox),
            spare: Arc::new(Mutex::new(Vec::new())),
            output,
        };
        let worker = std::thread::spawn(move || worker.run());

        let frame = vec![1u8; 16 * 8 * 3 / 2];
        // Taken by the worker, which then blocks inside the codec.
        encoder.encode(&frame, 1)?;
        std::thread::sleep(Duration::from_millis(50));
        // Fills the slot.
        encoder.encode(&frame, 2)?;

        let third_done = Arc::new(AtomicBool::new(false));
        let producer = {
            let encoder = Arc::clone(&encoder);
            let third_done = Arc::clone(&third_done);
            let frame = frame.clone();
            std::thread::spawn(move || {
                let result = encoder.encode(&frame, 3);
                third_done.store(true, Ordering::SeqCst);
                result
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(!third_done.load(Ordering::SeqCst));

        drop(held);
        producer.join().expect("producer thread")?;
        mailbox.close();
        worker.join().expect("worker thread");

        let timestamps: Vec<u64> = rx.try_iter().map(|(_, ts)| ts).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        Ok(())
    }
}
