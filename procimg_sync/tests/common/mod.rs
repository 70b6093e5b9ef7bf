//! Shared fixture: a small piCtory configuration over an in-memory image.
//!
//! | Position | Device | Offset | IOs                                        |
//! |----------|--------|--------|--------------------------------------------|
//! | 32       | mio    | 0      | counter@10 (u16), setpoint@12, lamp@14.0   |
//! | 33       | dio    | 16     | I_1@16.0, Counter_1@22, Counter_2@26, O_1  |
//! | 34       | ro     | 32     | relays@32                                  |
//! | 64       | virt   | 40     | Input_1..4@40..44, Output_1..4@44..48      |

#![allow(dead_code)]

use std::time::{Duration, Instant};

use procimg_common::config::SyncSettings;
use procimg_common::io::config::PiCtoryConfig;
use procimg_sync::source::MemoryHandle;
use procimg_sync::{MemoryByteSource, ProcessImage};

pub const CONFIG: &str = r#"{
    "App": {"name": "PiCtory"},
    "Devices": [
        {
            "name": "mio", "position": 32, "offset": 0,
            "productType": 118, "type": "LEFT_RIGHT",
            "inp": {"0": ["counter", 0, 16, 10, 1, "", "", ""]},
            "out": {
                "0": ["setpoint", 0, 16, 12, 1, "", "", ""],
                "1": ["lamp", 0, 1, 14, 0, "", "", 0]
            },
            "mem": {}
        },
        {
            "name": "dio", "position": 33, "offset": 16,
            "productType": 96, "type": "LEFT_RIGHT",
            "inp": {
                "0": ["I_1", 0, 1, 0, 1, "", "", 0],
                "1": ["Counter_1", 0, 32, 6, 0, "", "", ""],
                "2": ["Counter_2", 0, 32, 10, 0, "", "", ""]
            },
            "out": {"0": ["O_1", 0, 1, 14, 0, "", "", 0]},
            "mem": {}
        },
        {
            "name": "ro", "position": 34, "offset": 32,
            "productType": 137, "type": "LEFT_RIGHT",
            "out": {"0": ["relays", 0, 8, 0, 0, "", "", ""]}
        },
        {
            "name": "virt", "position": 64, "offset": 40,
            "productType": 24577, "type": "VIRTUAL",
            "inp": {
                "0": ["Input_1", 0, 8, 0, 0, "", "", ""],
                "1": ["Input_2", 0, 8, 1, 0, "", "", ""],
                "2": ["Input_3", 0, 8, 2, 0, "", "", ""],
                "3": ["Input_4", 0, 8, 3, 0, "", "", ""]
            },
            "out": {
                "0": ["Output_1", 0, 8, 4, 0, "", "", ""],
                "1": ["Output_2", 0, 8, 5, 0, "", "", ""],
                "2": ["Output_3", 0, 8, 6, 0, "", "", ""],
                "3": ["Output_4", 0, 8, 7, 0, "", "", ""]
            }
        }
    ]
}"#;

/// Size of the simulated image.
pub const IMAGE_SIZE: usize = 64;

/// Settings with a fast, fixed cycle time.
pub fn settings() -> SyncSettings {
    SyncSettings {
        cycle_time_ms: Some(20),
        ..SyncSettings::default()
    }
}

/// Image over the fixture configuration and the handle playing the hardware.
pub fn open_image(settings: SyncSettings) -> (ProcessImage, MemoryHandle) {
    let source = MemoryByteSource::new(IMAGE_SIZE);
    let hw = source.handle();
    let config = PiCtoryConfig::from_json(CONFIG).unwrap();
    let image = ProcessImage::from_parts(settings, config, Box::new(source)).unwrap();
    (image, hw)
}

/// Poll `check` until it holds or two seconds passed.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
