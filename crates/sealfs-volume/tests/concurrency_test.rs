//! Many threads over one volume: shared blocks, many files, unmount.

use secrecy::SecretString;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use sealfs_core::config::KdfConfig;
use sealfs_core::{IntegrityMode, Profile, SealfsError};
use sealfs_volume::{MountOptions, MountSecret, Volume};

fn fast_opts(profile: Profile) -> MountOptions {
    MountOptions {
        create_if_absent: Some(profile),
        kdf: KdfConfig {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        },
        ..MountOptions::default()
    }
}

fn mount_with(dir: &TempDir, opts: &MountOptions) -> Volume {
    Volume::mount(dir.path(), MountSecret::Passphrase(SecretString::from("pw")), opts)
        .expect("mount volume")
}

fn mount(dir: &TempDir, profile: Profile) -> Volume {
    mount_with(dir, &fast_opts(profile))
}

/// (label, options) for sparse growth, explicit zero blocks, and tagged blocks
fn growth_layouts() -> Vec<(&'static str, MountOptions)> {
    vec![
        ("sparse", fast_opts(Profile::Standard)),
        (
            "zero-filled",
            MountOptions {
                allow_holes: false,
                ..fast_opts(Profile::Standard)
            },
        ),
        (
            "tagged",
            MountOptions {
                integrity: Some(IntegrityMode::BlockMac),
                ..fast_opts(Profile::Standard)
            },
        ),
    ]
}

#[test]
fn writers_sharing_blocks_do_not_lose_updates() {
    const WRITERS: usize = 8;
    const SPAN: usize = 300;
    const CHUNK: usize = 50;

    for profile in [Profile::Standard, Profile::Paranoid] {
        let tmp = TempDir::new().unwrap();
        let vol = mount(&tmp, profile);
        let file = Arc::new(vol.create("shared", 0o644).unwrap());
        file.truncate((WRITERS * SPAN) as u64).unwrap();

        // spans of 300 bytes straddle 1024-byte blocks, so neighbours
        // read-modify-write the same block
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let file = Arc::clone(&file);
                thread::spawn(move || {
                    for round in 0..20u8 {
                        for chunk in 0..SPAN / CHUNK {
                            let offset = i * SPAN + chunk * CHUNK;
                            let value = (i as u8 + 1).wrapping_mul(round + 1);
                            file.write_at(offset as u64, &[value; CHUNK]).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let data = file.read_to_end().unwrap();
        assert_eq!(data.len(), WRITERS * SPAN);
        for i in 0..WRITERS {
            let expected = (i as u8 + 1).wrapping_mul(20);
            assert!(
                data[i * SPAN..(i + 1) * SPAN].iter().all(|&b| b == expected),
                "{profile}: span {i} lost an update"
            );
        }
    }
}

#[test]
fn writers_extending_past_end_keep_each_others_data() {
    const WRITERS: u64 = 8;
    const STRIDE: u64 = 5_000;

    for (label, opts) in growth_layouts() {
        for round in 0..10 {
            let tmp = TempDir::new().unwrap();
            let vol = mount_with(&tmp, &opts);
            let file = Arc::new(vol.create("gaps", 0o644).unwrap());
            let barrier = Arc::new(Barrier::new(WRITERS as usize));

            let handles: Vec<_> = (1..=WRITERS)
                .map(|i| {
                    let file = Arc::clone(&file);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        file.write_at(i * STRIDE, &[i as u8; 3]).unwrap();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let data = file.read_to_end().unwrap();
            assert_eq!(data.len() as u64, WRITERS * STRIDE + 3, "{label} round {round}: size");
            for i in 1..=WRITERS {
                let at = (i * STRIDE) as usize;
                assert_eq!(&data[at..at + 3], &[i as u8; 3], "{label} round {round}: writer {i} lost");
                let gap_start = ((i - 1) * STRIDE) as usize + if i == 1 { 0 } else { 3 };
                assert!(
                    data[gap_start..at].iter().all(|&b| b == 0),
                    "{label} round {round}: gap before writer {i} not zero"
                );
            }
        }
    }
}

#[test]
fn appends_racing_a_gap_write_survive() {
    for (label, opts) in growth_layouts() {
        for round in 0..10 {
            let tmp = TempDir::new().unwrap();
            let vol = mount_with(&tmp, &opts);
            let file = Arc::new(vol.create("log", 0o644).unwrap());
            file.write_at(0, &[1u8; 100]).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let appender = {
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // 100..2100, always starting at the end it saw
                    file.write_at(100, &[2u8; 2000]).unwrap();
                })
            };
            let extender = {
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    file.write_at(5000, b"mid").unwrap();
                    file.write_at(9000, b"end").unwrap();
                })
            };
            appender.join().unwrap();
            extender.join().unwrap();

            let data = file.read_to_end().unwrap();
            assert_eq!(data.len(), 9003, "{label} round {round}");
            assert!(data[..100].iter().all(|&b| b == 1), "{label} round {round}: head");
            assert!(data[100..2100].iter().all(|&b| b == 2), "{label} round {round}: appended bytes lost");
            assert!(data[2100..5000].iter().all(|&b| b == 0), "{label} round {round}: gap");
            assert_eq!(&data[5000..5003], b"mid");
            assert!(data[5003..9000].iter().all(|&b| b == 0), "{label} round {round}: gap");
            assert_eq!(&data[9000..], b"end");
        }
    }
}

#[test]
fn threads_on_separate_files() {
    let tmp = TempDir::new().unwrap();
    let vol = mount(&tmp, Profile::Paranoid);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let vol = vol.clone();
            thread::spawn(move || {
                let name = format!("file-{i}");
                let payload = vec![i as u8; 5000 + i * 37];
                let file = vol.create(&name, 0o644).unwrap();
                file.write_at(0, &payload).unwrap();
                assert_eq!(vol.open(&name).unwrap().read_to_end().unwrap(), payload);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(vol.readdir("/").unwrap().entries.len(), 6);
}

#[test]
fn unmount_waits_for_readers_then_stops_them() {
    let tmp = TempDir::new().unwrap();
    let vol = mount(&tmp, Profile::Standard);
    let expected = vec![0x5Au8; 4096];
    let file = Arc::new(vol.create("busy", 0o644).unwrap());
    file.write_at(0, &expected).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let file = Arc::clone(&file);
            let expected = expected.clone();
            thread::spawn(move || loop {
                match file.read_at(0, 4096) {
                    Ok(data) => assert_eq!(data, expected),
                    Err(SealfsError::Unmounted) => break,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    vol.unmount();
    for r in readers {
        r.join().unwrap();
    }
    assert!(!vol.is_mounted());
}
