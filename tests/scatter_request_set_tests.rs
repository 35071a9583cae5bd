//! Integration tests for scatter request sets and completion dispatch

use std::sync::{Arc, Mutex};

use memscatter::{
    LoopbackTransport, Pid, ScatterError, ScatterFlags, Session, SessionConfig, SetState,
};

const PID: Pid = Pid(1337);

fn target() -> (Arc<LoopbackTransport>, Session) {
    let transport = Arc::new(LoopbackTransport::new());
    for (i, base) in [0x1000u64, 0x2000, 0x3000].iter().enumerate() {
        transport.write_memory(PID, *base, &[(i as u8 + 1) * 0x11; 0x1000]);
    }
    let session = Session::with_config(transport.clone(), SessionConfig::new("set-tests")).unwrap();
    (transport, session)
}

#[cfg(test)]
mod scatter_request_set_tests {
    use super::*;

    /// Three reads, the middle address fails, the batch still completes
    #[test]
    fn test_partial_failure_is_isolated() {
        let (transport, session) = target();
        transport.fail_address(0x2000);

        let set = session.scatter(PID).unwrap();
        for address in [0x1000, 0x2000, 0x3000] {
            set.prepare_read(address, 16).unwrap();
        }
        set.execute().unwrap();

        assert_eq!(set.read(0x1000, 16).unwrap(), Some(vec![0x11; 16]));
        assert_eq!(set.read(0x2000, 16).unwrap(), None);
        assert_eq!(set.read(0x3000, 16).unwrap(), Some(vec![0x33; 16]));

        let stats = session.stats().snapshot();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.reads_materialized, 2);
        assert_eq!(stats.reads_failed, 1);
        assert_eq!(stats.transport_failures, 0);
    }

    /// Every read comes back at exactly the prepared length or not at all
    #[test]
    fn test_reads_are_exact_length_or_absent() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();

        // 0x3f00 + 0x200 runs into the unmapped page at 0x4000
        let requests = [
            (0x1000u64, 1usize),
            (0x1008, 8),
            (0x1ff0, 0x20),
            (0x2000, 0x1000),
            (0x3f00, 0x200),
            (0x9000, 4),
        ];
        for (address, length) in requests {
            set.prepare_read(address, length).unwrap();
        }
        set.execute().unwrap();

        for (address, length) in requests {
            match set.read(address, length).unwrap() {
                Some(bytes) => assert_eq!(bytes.len(), length, "read at {:#x}", address),
                None => assert!(address == 0x3f00 || address == 0x9000),
            }
            if let Some(buffer) = set.read_pooled(address, length).unwrap() {
                assert_eq!(buffer.len(), length);
                assert_eq!(buffer.as_slice().unwrap().len(), length);
            }
        }

        // A prepared address read at another length is absent, never truncated
        assert_eq!(set.read(0x2000, 0x10).unwrap(), None);
    }

    #[test]
    fn test_cleared_state_is_not_stale_readable() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        set.prepare_read(0x1000, 16).unwrap();
        set.execute().unwrap();
        assert!(set.read(0x1000, 16).unwrap().is_some());

        set.clear().unwrap();
        assert!(matches!(
            set.read(0x1000, 16),
            Err(ScatterError::InvalidState { .. })
        ));

        set.prepare_read(0x3000, 16).unwrap();
        set.execute().unwrap();
        assert_eq!(set.read(0x1000, 16).unwrap(), None);
        assert_eq!(set.read(0x3000, 16).unwrap(), Some(vec![0x33; 16]));
    }

    #[test]
    fn test_clear_invalidates_pooled_views() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        set.prepare_read(0x1000, 32).unwrap();
        set.execute().unwrap();

        let view = set.read_pooled(0x1000, 32).unwrap().unwrap();
        assert_eq!(view.to_vec().unwrap(), vec![0x11; 32]);

        set.clear().unwrap();
        assert!(view.is_released());
        assert!(matches!(
            view.as_slice(),
            Err(ScatterError::BufferReleased { length: 32 })
        ));
    }

    #[test]
    fn test_read_helpers() {
        let (transport, session) = target();
        transport.write_memory(PID, 0x1100, &0xdead_beef_cafe_f00du64.to_le_bytes());

        let set = session.scatter(PID).unwrap();
        set.prepare_read(0x1100, 8).unwrap();
        set.prepare_read(0x2000, 4).unwrap();
        set.execute().unwrap();

        assert_eq!(set.read_u64(0x1100).unwrap(), Some(0xdead_beef_cafe_f00d));
        let mut dest = [0u8; 4];
        assert!(set.read_into(0x2000, &mut dest).unwrap());
        assert_eq!(dest, [0x22; 4]);
        let mut wrong = [0u8; 5];
        assert!(!set.read_into(0x2000, &mut wrong).unwrap());
    }

    #[test]
    fn test_writes_land_on_execute() {
        let (transport, session) = target();
        let set = session.scatter(PID).unwrap();

        let mut data = vec![0xabu8; 8];
        set.prepare_write(0x1ffc, &data).unwrap();
        data.fill(0);
        assert_eq!(transport.read_memory(PID, 0x1ffc, 8).unwrap(), {
            let mut before = vec![0x11u8; 4];
            before.extend_from_slice(&[0x22; 4]);
            before
        });

        set.execute().unwrap();
        assert_eq!(transport.read_memory(PID, 0x1ffc, 8).unwrap(), vec![0xab; 8]);
        assert_eq!(session.stats().snapshot().writes_prepared, 1);
    }

    #[test]
    fn test_zeropad_on_fail_returns_zeroes() {
        let (transport, session) = target();
        transport.fail_address(0x2000);
        let set = session
            .scatter_with_flags(PID, ScatterFlags::ZEROPAD_ON_FAIL)
            .unwrap();
        set.prepare_read(0x2000, 16).unwrap();
        set.prepare_read(0x8000, 16).unwrap();
        set.execute().unwrap();

        assert_eq!(set.read(0x2000, 16).unwrap(), Some(vec![0; 16]));
        assert_eq!(set.read(0x8000, 16).unwrap(), Some(vec![0; 16]));
    }

    #[test]
    fn test_dispatch_order_bound_then_catch_all() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for address in [0x3000u64, 0x1000, 0x2000] {
            let log = log.clone();
            set.prepare_read_with(address, 4, move |completion| {
                log.lock()
                    .unwrap()
                    .push(format!("bound {:#x}", completion.address()));
            })
            .unwrap();
        }
        {
            let log = log.clone();
            set.add_receiver(0x1000, 4, move |_| {
                log.lock().unwrap().push("extra 0x1000".to_string());
            })
            .unwrap();
        }
        {
            let log = log.clone();
            set.on_completed(move |completion| {
                log.lock()
                    .unwrap()
                    .push(format!("all {:#x}", completion.address()));
            })
            .unwrap();
        }

        set.execute().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "bound 0x3000",
                "all 0x3000",
                "bound 0x1000",
                "extra 0x1000",
                "all 0x1000",
                "bound 0x2000",
                "all 0x2000",
            ]
        );
        assert_eq!(session.stats().snapshot().completions_dispatched, 7);
    }

    #[test]
    fn test_add_receiver_requires_prepared_read() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        set.prepare_read(0x1000, 8).unwrap();

        assert!(matches!(
            set.add_receiver(0x1000, 16, |_| {}),
            Err(ScatterError::InvalidParameter { .. })
        ));
        assert!(set.add_receiver(0x1000, 8, |_| {}).is_ok());
    }

    /// Receivers registered mid-dispatch wait for the next execute
    #[test]
    fn test_receivers_added_during_dispatch_run_next_time() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        let late_calls = Arc::new(Mutex::new(0u32));
        let registered = Arc::new(Mutex::new(false));

        {
            let late_calls = late_calls.clone();
            let registered = registered.clone();
            set.prepare_read_with(0x1000, 4, move |completion| {
                let mut registered = registered.lock().unwrap();
                if !*registered {
                    let late_calls = late_calls.clone();
                    completion
                        .set()
                        .on_completed(move |_| *late_calls.lock().unwrap() += 1)
                        .unwrap();
                    *registered = true;
                }
            })
            .unwrap();
        }
        set.prepare_read(0x2000, 4).unwrap();

        set.execute().unwrap();
        assert_eq!(*late_calls.lock().unwrap(), 0);

        // Re-execute re-dispatches persisted receivers, including the late one
        set.execute().unwrap();
        assert_eq!(*late_calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_receiver_may_not_clear_or_dispose_own_set() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        {
            let outcomes = outcomes.clone();
            set.prepare_read_with(0x1000, 4, move |completion| {
                let mut outcomes = outcomes.lock().unwrap();
                outcomes.push(matches!(
                    completion.set().clear(),
                    Err(ScatterError::Busy { .. })
                ));
                outcomes.push(matches!(
                    completion.set().dispose(),
                    Err(ScatterError::Busy { .. })
                ));
                outcomes.push(matches!(
                    completion.set().execute(),
                    Err(ScatterError::ReentrantExecute)
                ));
            })
            .unwrap();
        }

        set.execute().unwrap();
        assert_eq!(*outcomes.lock().unwrap(), vec![true, true, true]);
        assert_eq!(set.state(), SetState::Executed);
    }

    #[test]
    fn test_empty_set_skips_transport() {
        let (transport, session) = target();
        let set = session.scatter(PID).unwrap();
        set.execute().unwrap();

        assert_eq!(set.state(), SetState::Executed);
        assert_eq!(transport.stats().executes, 0);
        assert_eq!(session.stats().snapshot().executions, 0);
    }

    #[test]
    fn test_session_dispose_fails_set_operations() {
        let (_, session) = target();
        let set = session.scatter(PID).unwrap();
        set.prepare_read(0x1000, 4).unwrap();

        session.dispose();
        assert!(matches!(
            set.execute(),
            Err(ScatterError::SessionDisposed { .. })
        ));
        assert!(matches!(
            set.prepare_read(0x2000, 4),
            Err(ScatterError::SessionDisposed { .. })
        ));
        // Releasing the handle still works on a dead session
        set.dispose().unwrap();
    }

    #[test]
    fn test_dispose_releases_handle_once() {
        let (transport, session) = target();
        let set = session.scatter(PID).unwrap();
        let clone = set.clone();
        assert_eq!(transport.open_handles(), 1);

        set.dispose().unwrap();
        clone.dispose().unwrap();
        drop(set);
        drop(clone);

        let stats = transport.stats();
        assert_eq!(stats.handles_created, 1);
        assert_eq!(stats.handles_closed, 1);
        assert_eq!(transport.open_handles(), 0);
    }
}
