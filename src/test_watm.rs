//! In-process WATM doubles used by the test suite in lieu of compiled
//! `.wasm` fixtures (spec section 8), written as inline WAT text and
//! compiled with the `wat` crate at test time. A WATM's contents are
//! opaque to this crate either way (section 1, Out of scope), so a small,
//! deterministic double exercises exactly the same `tm`/`runtime`/`imports`
//! code path a real compiled guest would.

/// The minimal export surface every double shares: `watm_init_v1` and
/// `watm_ctrlpipe_v1` both succeed unconditionally.
const LIFECYCLE_PREAMBLE: &str = r#"
  (func $watm_init_v1 (result i32) i32.const 0)
  (func $watm_ctrlpipe_v1 (param i32) (result i32) i32.const 0)
  (export "watm_init_v1" (func $watm_init_v1))
  (export "watm_ctrlpipe_v1" (func $watm_ctrlpipe_v1))
"#;

/// A module whose `watm_dial_v1` calls `water_dial("tcp", "127.0.0.1:1")`
/// once and returns whatever code it got back, i.e. a Dialer Engage that
/// does exactly what a real guest's dial path would: marshal its own
/// `(network, address)` strings and hand them to the host import. Used to
/// exercise the Host Import Surface end to end (iovec marshaling,
/// validator, dial_fn) without a data-relay mainloop.
pub fn dialing_module() -> Vec<u8> {
    wat::parse_str(format!(
        r#"
        (module
          (import "env" "water_dial" (func $water_dial (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "tcp")
          (data (i32.const 8) "127.0.0.1:1")
          {preamble}
          (func $watm_dial_v1 (param i32) (result i32)
            (call $water_dial (i32.const 0) (i32.const 3) (i32.const 8) (i32.const 11)))
          (func $watm_start_v1 (result i32) i32.const 0)
          (export "watm_dial_v1" (func $watm_dial_v1))
          (export "watm_start_v1" (func $watm_start_v1))
        )
        "#,
        preamble = LIFECYCLE_PREAMBLE,
    ))
    .expect("dialing_module is valid WAT")
}

/// A module whose `watm_dial_v1` dials `address` via `water_dial` and
/// remembers both its caller FD (the parameter it was called with) and the
/// FD `water_dial` returned; `watm_start_v1` then performs exactly one
/// `fd_read` off the caller FD followed by one `fd_write` to the peer FD,
/// round-tripping whatever the caller wrote before Engage out to the
/// dialed destination. A full `poll_oneoff`-driven relay mainloop is out of
/// scope for a test double (see the module doc comment); a single
/// read/write pair still drives the exact `fd_read`/`fd_write` WASI path a
/// real guest's mainloop uses, which nothing else in the suite exercises.
pub fn relaying_dial_module(address: &str) -> Vec<u8> {
    let addr_len = address.len();
    wat::parse_str(format!(
        r#"
        (module
          (import "env" "water_dial" (func $water_dial (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "tcp")
          (data (i32.const 8) "{address}")
          (global $g_caller_fd (mut i32) (i32.const -1))
          (global $g_peer_fd (mut i32) (i32.const -1))
          {preamble}
          (func $watm_dial_v1 (param $caller_fd i32) (result i32)
            (local $peer i32)
            (global.set $g_caller_fd (local.get $caller_fd))
            (local.set $peer
              (call $water_dial (i32.const 0) (i32.const 3) (i32.const 8) (i32.const {addr_len})))
            (global.set $g_peer_fd (local.get $peer))
            (local.get $peer))
          (func $watm_start_v1 (result i32)
            ;; one iovec at 128: {{ptr=256, len=64}}; fd_read's nread lands at
            ;; 140, then the same iovec's len is overwritten with it before
            ;; fd_write so only the bytes actually read get relayed onward.
            (i32.store (i32.const 128) (i32.const 256))
            (i32.store (i32.const 132) (i32.const 64))
            (drop (call $fd_read (global.get $g_caller_fd) (i32.const 128) (i32.const 1) (i32.const 140)))
            (i32.store (i32.const 132) (i32.load (i32.const 140)))
            (drop (call $fd_write (global.get $g_peer_fd) (i32.const 128) (i32.const 1) (i32.const 144)))
            (i32.const 0))
          (export "watm_dial_v1" (func $watm_dial_v1))
          (export "watm_start_v1" (func $watm_start_v1))
        )
        "#,
        preamble = LIFECYCLE_PREAMBLE,
    ))
    .expect("relaying_dial_module is valid WAT")
}

/// A module whose `watm_start_v1` never returns on its own — an infinite
/// loop with no imports, used to exercise the forceful half of cancellation
/// (spec section 4.E/5: the engine-epoch trap fallback) without needing a
/// guest that actually blocks on a WASI poll.
pub fn spin_forever_module() -> Vec<u8> {
    wat::parse_str(format!(
        r#"
        (module
          {preamble}
          (func $watm_start_v1 (result i32)
            (loop $spin
              br $spin))
          (export "watm_start_v1" (func $watm_start_v1))
        )
        "#,
        preamble = LIFECYCLE_PREAMBLE,
    ))
    .expect("spin_forever_module is valid WAT")
}

/// A module whose `watm_start_v1` returns success immediately — the
/// simplest possible double, used where a test only needs the worker to
/// exist and exit cleanly (e.g. close()/watcher idempotency) without
/// exercising any import.
pub fn immediate_exit_module() -> Vec<u8> {
    wat::parse_str(format!(
        r#"
        (module
          {preamble}
          (func $watm_start_v1 (result i32) i32.const 0)
          (export "watm_start_v1" (func $watm_start_v1))
        )
        "#,
        preamble = LIFECYCLE_PREAMBLE,
    ))
    .expect("immediate_exit_module is valid WAT")
}
