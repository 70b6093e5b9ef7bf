//! Event tests: mainloop dispatch, prefire, delays, worker-thread events,
//! `wait` and `cycleloop`.

mod common;

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::{eventually, open_image, settings};
use parking_lot::Mutex;
use procimg_common::io::format::IoValue;
use procimg_common::io::types::Edge;
use procimg_sync::{EventHandler, EventSpec, SyncError, WaitOutcome};

/// Handler that records values and ends the mainloop after `stop_after`
/// calls.
fn recorder(
    image: &procimg_sync::ProcessImage,
    stop_after: usize,
) -> (EventHandler, Arc<Mutex<Vec<IoValue>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let image = image.clone();
    let handler = EventHandler::new(move |ctx| {
        let mut values = sink.lock();
        values.push(ctx.value.clone());
        if values.len() >= stop_after {
            image.exit(false);
        }
        Ok(())
    });
    (handler, seen)
}

#[test]
fn mainloop_dispatches_changes_in_order() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let (handler, seen) = recorder(&image, 1);
    image
        .io("Input_1")
        .unwrap()
        .reg_event(EventSpec::new(handler))
        .unwrap();

    let watcher = image.clone();
    let feeder = thread::spawn(move || {
        assert!(eventually(|| watcher.engine().collecting_events()));
        hw.set(40, &[7]);
        hw
    });

    image.mainloop().unwrap();
    let hw = feeder.join().unwrap();
    assert_eq!(*seen.lock(), vec![IoValue::Int(7)]);

    // A plain exit ends the loop but keeps autorefresh running.
    assert!(image.engine().is_alive());
    assert!(image.devices().iter().all(|d| d.is_autorefresh()));
    image.io("Output_1").unwrap().set_value(3i64).unwrap();
    assert!(eventually(|| hw.get(44, 1) == vec![3]));

    image.cleanup().unwrap();
    assert!(!image.engine().is_alive());
    assert!(image.devices().iter().all(|d| !d.is_autorefresh()));
}

#[test]
fn full_exit_from_a_callback_releases_devices() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let output = image.io("Output_1").unwrap();
    let stopper = image.clone();
    let handler = EventHandler::new(move |_| {
        output.set_value(4i64)?;
        stopper.exit(true);
        Ok(())
    });
    image
        .io("Input_1")
        .unwrap()
        .reg_event(EventSpec::new(handler).prefire())
        .unwrap();

    image.mainloop().unwrap();
    assert!(!image.engine().is_alive());
    assert!(image.devices().iter().all(|d| !d.is_autorefresh()));
    // Outputs are flushed on the way out.
    assert_eq!(hw.get(44, 1), vec![4]);
}

#[test]
fn prefire_fires_once_with_the_current_value() {
    let (image, hw) = open_image(settings());
    hw.set(41, &[5]);
    image.autorefresh_all().unwrap();
    let (handler, seen) = recorder(&image, 1);
    image
        .io("Input_2")
        .unwrap()
        .reg_event(EventSpec::new(handler).prefire())
        .unwrap();

    image.mainloop().unwrap();
    assert_eq!(*seen.lock(), vec![IoValue::Int(5)]);
}

#[test]
fn rising_edge_filters_bit_changes() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let (handler, seen) = recorder(&image, 1);
    image
        .io("I_1")
        .unwrap()
        .reg_event(EventSpec::new(handler).edge(Edge::Rising))
        .unwrap();

    let watcher = image.clone();
    let feeder = thread::spawn(move || {
        assert!(eventually(|| watcher.engine().collecting_events()));
        // A sibling bit alone does not count.
        hw.set(16, &[0x02]);
        thread::sleep(Duration::from_millis(60));
        hw.set(16, &[0x03]);
    });

    image.mainloop().unwrap();
    feeder.join().unwrap();
    assert_eq!(*seen.lock(), vec![IoValue::Bool(true)]);
}

#[test]
fn delayed_event_fires_after_its_delay() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let (handler, seen) = recorder(&image, 1);
    image
        .io("Input_3")
        .unwrap()
        .reg_event(EventSpec::new(handler).delay(100))
        .unwrap();

    let watcher = image.clone();
    let feeder = thread::spawn(move || {
        assert!(eventually(|| watcher.engine().collecting_events()));
        let at = Instant::now();
        hw.set(42, &[1]);
        at
    });

    image.mainloop().unwrap();
    let set_at = feeder.join().unwrap();
    assert!(set_at.elapsed() >= Duration::from_millis(80));
    assert_eq!(*seen.lock(), vec![IoValue::Int(1)]);
}

#[test]
fn overwriting_delay_drops_event_on_revert() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let (handler, seen) = recorder(&image, 1);
    image
        .io("I_1")
        .unwrap()
        .reg_event(EventSpec::new(handler).edge(Edge::Rising).delay(500))
        .unwrap();

    let watcher = image.clone();
    let feeder = thread::spawn(move || {
        assert!(eventually(|| watcher.engine().collecting_events()));
        hw.set(16, &[0x01]);
        assert!(eventually(|| watcher.engine().pending_delays() == 1));
        hw.set(16, &[0x00]);
        assert!(eventually(|| watcher.engine().pending_delays() == 0));
        thread::sleep(Duration::from_millis(700));
        watcher.exit(false);
    });

    image.mainloop().unwrap();
    feeder.join().unwrap();
    assert!(seen.lock().is_empty());
}

#[test]
fn thread_events_run_off_the_mainloop() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler = EventHandler::new(move |ctx| {
        let _ = tx.lock().send((thread::current().name().map(String::from), ctx.value.clone()));
        Ok(())
    });
    image
        .io("Input_1")
        .unwrap()
        .reg_event(EventSpec::new(handler).as_thread())
        .unwrap();

    let looping = image.clone();
    let mainloop = thread::spawn(move || looping.mainloop());
    assert!(eventually(|| image.engine().collecting_events()));
    hw.set(40, &[9]);

    let (name, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(value, IoValue::Int(9));
    assert_eq!(name.as_deref(), Some("event-Input_1"));

    image.exit(false);
    mainloop.join().unwrap().unwrap();
}

#[test]
fn callback_error_ends_the_mainloop() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let handler = EventHandler::new(|ctx| Err(SyncError::InvalidEdge(ctx.io_name.clone())));
    image
        .io("Input_1")
        .unwrap()
        .reg_event(EventSpec::new(handler))
        .unwrap();

    let watcher = image.clone();
    thread::spawn(move || {
        assert!(eventually(|| watcher.engine().collecting_events()));
        hw.set(40, &[1]);
    });

    assert!(matches!(image.mainloop(), Err(SyncError::InvalidEdge(_))));
    assert!(!image.loop_running());
    // Only a lost engine tears autorefresh down.
    assert!(image.engine().is_alive());
    image.cleanup().unwrap();
}

#[test]
fn registration_rules() {
    let (image, _hw) = open_image(settings());
    let handler = EventHandler::new(|_| Ok(()));
    let word = image.io("Input_1").unwrap();
    let bit = image.io("I_1").unwrap();

    assert!(matches!(
        word.reg_event(EventSpec::new(handler.clone()).edge(Edge::Rising)),
        Err(SyncError::InvalidEdge(_))
    ));

    bit.reg_event(EventSpec::new(handler.clone()).edge(Edge::Rising))
        .unwrap();
    bit.reg_event(EventSpec::new(handler.clone()).edge(Edge::Falling))
        .unwrap();
    assert!(matches!(
        bit.reg_event(EventSpec::new(handler.clone())),
        Err(SyncError::DuplicateCallback { .. })
    ));

    // Another closure with the same code is a different handler.
    let other = EventHandler::new(|_| Ok(()));
    bit.reg_event(EventSpec::new(other.clone())).unwrap();

    bit.unreg_event(Some(&handler), Some(Edge::Rising)).unwrap();
    bit.reg_event(EventSpec::new(handler.clone()).edge(Edge::Rising))
        .unwrap();
    bit.unreg_event(None, None).unwrap();
    bit.reg_event(EventSpec::new(handler)).unwrap();
}

#[test]
fn loops_need_live_devices_and_run_alone() {
    let (image, _hw) = open_image(settings());
    assert!(matches!(image.mainloop(), Err(SyncError::NoLiveDevices)));

    image.autorefresh_all().unwrap();
    let looping = image.clone();
    let mainloop = thread::spawn(move || looping.mainloop());
    assert!(eventually(|| image.loop_running()));

    assert!(matches!(
        image.cycleloop(|_| Ok(Some(())), None),
        Err(SyncError::LoopRunning)
    ));
    assert!(matches!(image.set_cycle_time(50), Err(SyncError::LoopRunning)));
    let handler = EventHandler::new(|_| Ok(()));
    assert!(matches!(
        image
            .io("Input_1")
            .unwrap()
            .reg_event(EventSpec::new(handler).prefire()),
        Err(SyncError::PrefireWhileRunning)
    ));

    image.exit(false);
    mainloop.join().unwrap().unwrap();
}

#[test]
fn wait_outcomes() {
    let (image, hw) = open_image(settings());
    let bit = image.io("I_1").unwrap();
    assert!(matches!(
        bit.wait(Edge::Both, None, None, 100),
        Err(SyncError::NoAutorefresh(_))
    ));

    image.autorefresh_all().unwrap();
    assert_eq!(
        bit.wait(Edge::Both, None, Some(&IoValue::Bool(false)), 0).unwrap(),
        WaitOutcome::OkValue
    );
    assert_eq!(
        bit.wait(Edge::Both, None, None, 100).unwrap(),
        WaitOutcome::Timeout
    );

    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        hw.set(16, &[0x01]);
    });
    assert_eq!(
        bit.wait(Edge::Rising, None, None, 2000).unwrap(),
        WaitOutcome::Changed
    );
    feeder.join().unwrap();

    let stopper = image.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        stopper.exit(false);
    });
    let outcome = bit.wait(Edge::Both, None, None, 0).unwrap();
    assert_eq!(outcome, WaitOutcome::Exited);
    assert_eq!(outcome.code(), 100);
    image.cleanup().unwrap();
}

#[test]
fn cycleloop_runs_until_a_value_is_returned() {
    let (image, hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let output = image.io("Output_1").unwrap();

    let mut cycles = 0;
    let result = image
        .cycleloop(
            |tools| {
                cycles += 1;
                if tools.first {
                    output.set_value(9i64)?;
                }
                Ok((cycles == 5).then_some(cycles))
            },
            Some(10),
        )
        .unwrap();
    assert_eq!(result, Some(5));
    assert_eq!(image.cycle_time_ms(), 20);
    assert!(eventually(|| hw.get(44, 1) == vec![9]));
    assert!(image.engine().is_alive());
    image.cleanup().unwrap();
}

#[test]
fn cycleloop_exit_runs_a_last_cycle() {
    let (image, _hw) = open_image(settings());
    image.autorefresh_all().unwrap();
    let stopper = image.clone();

    let mut last_seen = false;
    let result = image
        .cycleloop(
            |tools| {
                if tools.first {
                    stopper.exit(false);
                }
                last_seen |= tools.last;
                Ok(None::<()>)
            },
            None,
        )
        .unwrap();
    assert_eq!(result, None);
    assert!(last_seen);
    assert!(image.engine().is_alive());
    image.cleanup().unwrap();
}
