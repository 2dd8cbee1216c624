use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mwlink_session::{CallOptions, LinkEvent, PendingTable, RequestError, Session};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{
    self, codes, Altitude, Analog, Attitude, CompGps, GpsUpdate, Ident, Misc, Pid, RawGps, RawImu,
    RcChannels, RcTuning, ServoConfEntry, Status, Waypoint,
};

type DecodeError = Box<dyn std::error::Error + Send + Sync>;
type CallResult<T> = std::result::Result<T, RequestError>;

const CACHED: CallOptions = CallOptions {
    priority: false,
    cache: true,
};

/// One polling-cycle worth of telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Unix milliseconds at the end of the cycle.
    pub time_ms: u64,
    /// Wall-clock duration of the whole battery.
    pub cycle_ms: u64,
    pub status: Status,
    pub raw_imu: RawImu,
    pub rc: RcChannels,
    pub raw_gps: RawGps,
    pub comp_gps: CompGps,
    pub attitude: Attitude,
    pub altitude: Altitude,
    pub analog: Analog,
}

/// The request/response and background-polling API for one device.
///
/// Construction subscribes to the session's transport lifecycle: every
/// attach primes the identity caches and starts a polling loop that
/// re-arms itself as fast as round trips complete, appending a
/// [`Snapshot`] per cycle to the in-memory history until the transport
/// detaches.
pub struct Device {
    session: Arc<Session>,
    history: Mutex<Vec<Snapshot>>,
    observers: Mutex<Vec<Box<dyn Fn(&Snapshot) + Send + Sync>>>,
    poll_generation: AtomicU64,
}

impl Device {
    /// Wrap a session in a device facade.
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let device = Arc::new(Self {
            session: Arc::clone(&session),
            history: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            poll_generation: AtomicU64::new(0),
        });

        let weak: Weak<Device> = Arc::downgrade(&device);
        session.on_link(move |event| {
            let Some(device) = weak.upgrade() else { return };
            match event {
                LinkEvent::Attached => device.start_polling(),
                LinkEvent::Detached => {
                    // Invalidate the running loop; it exits on its next check.
                    device.poll_generation.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        if session.is_attached() {
            Arc::clone(&device).start_polling();
        }
        device
    }

    /// The endpoint key of the underlying session.
    pub fn key(&self) -> &str {
        self.session.key()
    }

    /// Whether a transport is currently attached.
    pub fn is_connected(&self) -> bool {
        self.session.is_attached()
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Register an observer for polling snapshots.
    pub fn on_update(&self, observer: impl Fn(&Snapshot) + Send + Sync + 'static) {
        lock(&self.observers).push(Box::new(observer));
    }

    /// All snapshots recorded so far.
    pub fn history(&self) -> Vec<Snapshot> {
        lock(&self.history).clone()
    }

    /// The most recent snapshot, if any.
    pub fn latest(&self) -> Option<Snapshot> {
        lock(&self.history).last().cloned()
    }

    /// Issue a catalog request in blocking mode.
    pub fn request<T>(
        &self,
        code: u8,
        payload: &[u8],
        options: CallOptions,
        decode: impl FnOnce(&Bytes) -> std::result::Result<T, DecodeError>,
    ) -> CallResult<T> {
        self.table()?.call(code, payload, options, decode)
    }

    /// Issue a catalog request in callback mode; `on_complete` fires on a
    /// worker thread (twice on a cache hit, per the caching contract).
    ///
    /// Fails fast — without invoking the callback — when no transport is
    /// attached.
    pub fn request_with<T, D, F>(
        &self,
        code: u8,
        payload: impl Into<Bytes>,
        options: CallOptions,
        decode: D,
        on_complete: F,
    ) -> CallResult<()>
    where
        T: Send + 'static,
        D: Fn(&Bytes) -> std::result::Result<T, DecodeError> + Send + 'static,
        F: Fn(CallResult<T>) + Send + 'static,
    {
        self.table()?.call_with(code, payload, options, decode, on_complete);
        Ok(())
    }

    // Catalog reads. Identity records are served through the response
    // cache; telemetry always does a full round trip.

    pub fn ident(&self) -> CallResult<Ident> {
        self.request(codes::IDENT, &[], CACHED, |b| {
            Ident::decode(b).map_err(Into::into)
        })
    }

    pub fn status(&self) -> CallResult<Status> {
        self.request(codes::STATUS, &[], CallOptions::default(), |b| {
            Status::decode(b).map_err(Into::into)
        })
    }

    pub fn raw_imu(&self) -> CallResult<RawImu> {
        self.request(codes::RAW_IMU, &[], CallOptions::default(), |b| {
            RawImu::decode(b).map_err(Into::into)
        })
    }

    pub fn servo(&self) -> CallResult<[u16; 8]> {
        self.request(codes::SERVO, &[], CallOptions::default(), |b| {
            catalog::decode_servo(b).map_err(Into::into)
        })
    }

    pub fn motor(&self) -> CallResult<[u16; 8]> {
        self.request(codes::MOTOR, &[], CallOptions::default(), |b| {
            catalog::decode_motor(b).map_err(Into::into)
        })
    }

    pub fn rc(&self) -> CallResult<RcChannels> {
        self.request(codes::RC, &[], CallOptions::default(), |b| {
            RcChannels::decode(b).map_err(Into::into)
        })
    }

    pub fn raw_gps(&self) -> CallResult<RawGps> {
        self.request(codes::RAW_GPS, &[], CallOptions::default(), |b| {
            RawGps::decode(b).map_err(Into::into)
        })
    }

    pub fn comp_gps(&self) -> CallResult<CompGps> {
        self.request(codes::COMP_GPS, &[], CallOptions::default(), |b| {
            CompGps::decode(b).map_err(Into::into)
        })
    }

    pub fn attitude(&self) -> CallResult<Attitude> {
        self.request(codes::ATTITUDE, &[], CallOptions::default(), |b| {
            Attitude::decode(b).map_err(Into::into)
        })
    }

    pub fn altitude(&self) -> CallResult<Altitude> {
        self.request(codes::ALTITUDE, &[], CallOptions::default(), |b| {
            Altitude::decode(b).map_err(Into::into)
        })
    }

    pub fn analog(&self) -> CallResult<Analog> {
        self.request(codes::ANALOG, &[], CallOptions::default(), |b| {
            Analog::decode(b).map_err(Into::into)
        })
    }

    pub fn rc_tuning(&self) -> CallResult<RcTuning> {
        self.request(codes::RC_TUNING, &[], CallOptions::default(), |b| {
            RcTuning::decode(b).map_err(Into::into)
        })
    }

    pub fn pid(&self) -> CallResult<Pid> {
        self.request(codes::PID, &[], CallOptions::default(), |b| {
            Pid::decode(b).map_err(Into::into)
        })
    }

    pub fn boxes(&self) -> CallResult<Vec<u16>> {
        self.request(codes::BOXES, &[], CallOptions::default(), |b| {
            catalog::decode_boxes(b).map_err(Into::into)
        })
    }

    pub fn misc(&self) -> CallResult<Misc> {
        self.request(codes::MISC, &[], CallOptions::default(), |b| {
            Misc::decode(b).map_err(Into::into)
        })
    }

    pub fn motor_pins(&self) -> CallResult<[u8; 8]> {
        self.request(codes::MOTOR_PINS, &[], CallOptions::default(), |b| {
            catalog::decode_motor_pins(b).map_err(Into::into)
        })
    }

    pub fn box_names(&self) -> CallResult<Vec<String>> {
        self.request(codes::BOX_NAMES, &[], CACHED, |b| {
            catalog::decode_names(b).map_err(Into::into)
        })
    }

    pub fn pid_names(&self) -> CallResult<Vec<String>> {
        self.request(codes::PID_NAMES, &[], CACHED, |b| {
            catalog::decode_names(b).map_err(Into::into)
        })
    }

    pub fn waypoint(&self) -> CallResult<Waypoint> {
        self.request(codes::WAYPOINT, &[], CallOptions::default(), |b| {
            Waypoint::decode(b).map_err(Into::into)
        })
    }

    pub fn box_ids(&self) -> CallResult<Vec<i8>> {
        self.request(codes::BOX_IDS, &[], CallOptions::default(), |b| {
            catalog::decode_box_ids(b).map_err(Into::into)
        })
    }

    pub fn servo_conf(&self) -> CallResult<[ServoConfEntry; 8]> {
        self.request(codes::SERVO_CONF, &[], CallOptions::default(), |b| {
            catalog::decode_servo_conf(b).map_err(Into::into)
        })
    }

    // Catalog writes. The device acknowledges each with an empty frame of
    // the same code.

    pub fn set_raw_rc(&self, channels: &RcChannels) -> CallResult<()> {
        self.write(codes::SET_RAW_RC, &channels.encode())
    }

    pub fn set_raw_gps(&self, update: &GpsUpdate) -> CallResult<()> {
        self.write(codes::SET_RAW_GPS, &update.encode())
    }

    pub fn set_pid(&self, bank: &Pid) -> CallResult<()> {
        self.write(codes::SET_PID, &bank.encode())
    }

    pub fn set_boxes(&self, boxes: &[u16]) -> CallResult<()> {
        self.write(codes::SET_BOXES, &catalog::encode_boxes(boxes))
    }

    pub fn set_rc_tuning(&self, tuning: &RcTuning) -> CallResult<()> {
        self.write(codes::SET_RC_TUNING, &tuning.encode())
    }

    pub fn acc_calibration(&self) -> CallResult<()> {
        self.write(codes::ACC_CALIBRATION, &[])
    }

    pub fn mag_calibration(&self) -> CallResult<()> {
        self.write(codes::MAG_CALIBRATION, &[])
    }

    pub fn set_misc(&self, misc: &Misc) -> CallResult<()> {
        self.write(codes::SET_MISC, &misc.encode())
    }

    pub fn reset_conf(&self) -> CallResult<()> {
        self.write(codes::RESET_CONF, &[])
    }

    pub fn set_waypoint(&self, waypoint: &Waypoint) -> CallResult<()> {
        self.write(codes::SET_WAYPOINT, &waypoint.encode())
    }

    pub fn select_setting(&self, setting: u8) -> CallResult<()> {
        self.write(codes::SELECT_SETTING, &[setting])
    }

    pub fn set_heading(&self, heading: i16) -> CallResult<()> {
        self.write(codes::SET_HEADING, &heading.to_le_bytes())
    }

    pub fn set_servo_conf(&self, entries: &[ServoConfEntry; 8]) -> CallResult<()> {
        self.write(codes::SET_SERVO_CONF, &catalog::encode_servo_conf(entries))
    }

    fn write(&self, code: u8, payload: &[u8]) -> CallResult<()> {
        self.request(code, payload, CallOptions::default(), |_| Ok(()))
    }

    fn table(&self) -> CallResult<PendingTable> {
        self.session.table().ok_or(RequestError::LinkClosed)
    }

    fn start_polling(self: Arc<Self>) {
        let generation = self.poll_generation.fetch_add(1, Ordering::SeqCst) + 1;
        thread::spawn(move || {
            info!(key = %self.session.key(), "polling loop started");
            if let Err(err) = self.prime_identity() {
                warn!(key = %self.session.key(), error = %err, "identity priming failed");
            }
            loop {
                if self.poll_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                let Some(table) = self.session.table() else { break };
                match self.poll_cycle(&table) {
                    Ok(snapshot) => {
                        lock(&self.history).push(snapshot.clone());
                        for observer in lock(&self.observers).iter() {
                            observer(&snapshot);
                        }
                    }
                    Err(RequestError::LinkClosed) => break,
                    Err(err) => {
                        // Transient (timeout, decode); the next cycle retries.
                        warn!(key = %self.session.key(), error = %err, "polling cycle failed");
                    }
                }
            }
            info!(key = %self.session.key(), "polling loop stopped");
        });
    }

    fn prime_identity(&self) -> CallResult<()> {
        self.ident()?;
        self.box_names()?;
        self.pid_names()?;
        Ok(())
    }

    /// One fixed battery of reads, timed wall-clock.
    fn poll_cycle(&self, table: &PendingTable) -> CallResult<Snapshot> {
        let options = CallOptions::default();
        let started = Instant::now();
        let status = table.call(codes::STATUS, &[], options, |b| {
            Status::decode(b).map_err(Into::into)
        })?;
        let raw_imu = table.call(codes::RAW_IMU, &[], options, |b| {
            RawImu::decode(b).map_err(Into::into)
        })?;
        let rc = table.call(codes::RC, &[], options, |b| {
            RcChannels::decode(b).map_err(Into::into)
        })?;
        let raw_gps = table.call(codes::RAW_GPS, &[], options, |b| {
            RawGps::decode(b).map_err(Into::into)
        })?;
        let comp_gps = table.call(codes::COMP_GPS, &[], options, |b| {
            CompGps::decode(b).map_err(Into::into)
        })?;
        let attitude = table.call(codes::ATTITUDE, &[], options, |b| {
            Attitude::decode(b).map_err(Into::into)
        })?;
        let altitude = table.call(codes::ALTITUDE, &[], options, |b| {
            Altitude::decode(b).map_err(Into::into)
        })?;
        let analog = table.call(codes::ANALOG, &[], options, |b| {
            Analog::decode(b).map_err(Into::into)
        })?;

        Ok(Snapshot {
            time_ms: unix_ms(),
            cycle_ms: started.elapsed().as_millis() as u64,
            status,
            raw_imu,
            rc,
            raw_gps,
            comp_gps,
            attitude,
            altitude,
            analog,
        })
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, SyncSender};
    use std::time::Duration;

    use mwlink_frame::{Direction, EnvelopeDecoder};

    use super::*;

    /// Write half that hands each outgoing request envelope to the
    /// responder thread.
    struct WireTap {
        tx: SyncSender<Vec<u8>>,
    }

    impl Write for WireTap {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // The responder may already be gone during teardown.
            let _ = self.tx.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn canned_payload(code: u8) -> Option<Vec<u8>> {
        Some(match code {
            codes::IDENT => vec![230, 3, 0, 1, 0, 0, 0],
            codes::STATUS => {
                let mut p = vec![0u8; 11];
                p[0] = 0xAC; // cycle time 3500 µs
                p[1] = 0x0D;
                p[4] = 0b11; // acc + baro
                p
            }
            codes::RAW_IMU => vec![0u8; 18],
            codes::RC => {
                let mut p = Vec::new();
                for v in [1500u16, 1500, 1500, 1100, 1000, 1000, 1000, 1000] {
                    p.extend_from_slice(&v.to_le_bytes());
                }
                p
            }
            codes::RAW_GPS => vec![0u8; 16],
            codes::COMP_GPS => vec![0u8; 5],
            codes::ATTITUDE => vec![0u8; 6],
            codes::ALTITUDE => vec![0u8; 6],
            codes::ANALOG => vec![105, 0, 0, 0, 0, 0, 0], // 10.5 V
            codes::BOX_NAMES => b"ARM;BARO;".to_vec(),
            codes::PID_NAMES => b"ROLL;PITCH;".to_vec(),
            _ => return None,
        })
    }

    /// Attach a scripted transport to `session` and answer every request
    /// from the canned catalog until the session goes quiet.
    fn attach_scripted_transport(session: &Arc<Session>) -> PendingTable {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(256);
        let table = PendingTable::new(Box::new(WireTap { tx }));
        session.attach(table.clone());

        let responder_table = table.clone();
        thread::spawn(move || {
            let mut decoder = EnvelopeDecoder::new(Direction::Request);
            while let Ok(wire) = rx.recv_timeout(Duration::from_secs(2)) {
                decoder.extend(&wire);
                while let Some(frame) = decoder.decode() {
                    match canned_payload(frame.code) {
                        Some(payload) => {
                            responder_table.complete(frame.id, Bytes::from(payload));
                        }
                        None => responder_table.complete(frame.id, Bytes::new()),
                    }
                }
            }
        });
        table
    }

    #[test]
    fn attach_starts_polling_and_records_history() {
        let session = Session::new("test-device");
        let device = Device::new(Arc::clone(&session));

        let updates = Arc::new(AtomicUsize::new(0));
        {
            let updates = Arc::clone(&updates);
            device.on_update(move |snapshot| {
                assert_eq!(snapshot.status.cycle_time_us, 3500);
                updates.fetch_add(1, Ordering::SeqCst);
            });
        }

        let table = attach_scripted_transport(&session);

        let deadline = Instant::now() + Duration::from_secs(5);
        while device.history().len() < 2 {
            assert!(Instant::now() < deadline, "polling should record snapshots");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(updates.load(Ordering::SeqCst) >= 2);

        let snapshot = device.latest().expect("history should have a snapshot");
        assert!(snapshot.status.acc_present);
        assert!(snapshot.status.baro_present);
        assert_eq!(snapshot.analog.vbat, 10.5);
        assert!(snapshot.time_ms > 0);

        // Tear the transport down; the loop stops for good.
        table.close();
        session.detach_if(&table);
        thread::sleep(Duration::from_millis(100));
        let settled = device.history().len();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(device.history().len(), settled, "polling should stop on detach");
        assert!(!device.is_connected());
    }

    #[test]
    fn facade_reads_decode_canned_records() {
        let session = Session::new("test-device");
        let device = Device::new(Arc::clone(&session));
        let _table = attach_scripted_transport(&session);

        let ident = device.ident().expect("ident should decode");
        assert_eq!(ident.version, 230);

        let names = device.box_names().expect("box names should decode");
        assert_eq!(names, vec!["ARM", "BARO"]);

        let rc = device.rc().expect("rc should decode");
        assert_eq!(rc.throttle, 1100);
    }

    #[test]
    fn writes_complete_on_device_ack() {
        let session = Session::new("test-device");
        let device = Device::new(Arc::clone(&session));
        let _table = attach_scripted_transport(&session);

        device.select_setting(1).expect("write should be acknowledged");
        device.set_heading(-90).expect("write should be acknowledged");
    }

    #[test]
    fn calls_on_detached_device_fail_fast() {
        let session = Session::new("lonely");
        let device = Device::new(Arc::clone(&session));

        let err = device.status().expect_err("detached call should fail");
        assert!(matches!(err, RequestError::LinkClosed));

        let err = device
            .request_with(codes::STATUS, Bytes::new(), CallOptions::default(), |_| Ok(()), |_| {})
            .expect_err("detached callback call should fail");
        assert!(matches!(err, RequestError::LinkClosed));
    }
}
