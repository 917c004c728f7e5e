use std::io::{self, BufRead, Write};
use std::time::Duration;
use chrono::Local;
use crossbeam_channel::{unbounded, Receiver};
use heartbeat_monitor::{Config, ConnectionManager, LifecycleEvent, MonitorSession};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using default settings", e);
            Config::default()
        }
    };

    let mut manager = match ConnectionManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    // Stdin is read on its own thread so a monitoring loop can keep draining
    // events while waiting for the operator to press Enter.
    let lines = spawn_stdin_reader();

    match std::env::args().nth(1) {
        Some(address) => monitor(&mut manager, &address, &lines),
        None => main_menu(&mut manager, &lines),
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (sender, receiver) = unbounded();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = io::stdout().flush();
}

fn main_menu(manager: &mut ConnectionManager, lines: &Receiver<String>) {
    loop {
        println!("\nHeart Rate Monitor");
        println!("1. Scan for heart rate devices");
        println!("2. Monitor a device");
        println!("0. Exit");
        prompt("Enter your choice: ");

        let Ok(choice) = lines.recv() else { break };
        match choice.trim() {
            "1" => scan(manager),
            "2" => {
                prompt("Enter the device address (0 to go back): ");
                let Ok(address) = lines.recv() else { break };
                let address = address.trim();
                if address.is_empty() || address == "0" {
                    continue;
                }
                monitor(manager, address, lines);
            }
            "0" => break,
            _ => println!("Invalid choice. Please enter 1, 2, or 0."),
        }
    }
    println!("Exiting.");
}

fn scan(manager: &ConnectionManager) {
    println!("Scanning for devices ({}s)...", manager.config().scan_duration_secs);
    match manager.scan() {
        Ok(devices) if devices.is_empty() => {
            println!("No devices found. Ensure your heart rate monitor is awake and advertising.");
        }
        Ok(devices) => {
            println!("\nAvailable devices:");
            for (idx, device) in devices.iter().enumerate() {
                println!("{}. {} - {}", idx + 1, device.label(), device.address);
            }
        }
        Err(e) => println!("Scan failed: {}", e),
    }
}

fn monitor(manager: &mut ConnectionManager, address: &str, lines: &Receiver<String>) {
    let session = match manager.start(address) {
        Ok(session) => session,
        Err(e) => {
            println!("Could not start monitoring: {}", e);
            return;
        }
    };

    println!("Connecting to {}... press Enter to stop.", session.address());
    loop {
        if lines.try_recv().is_ok() {
            break;
        }
        let events = session.wait(POLL_INTERVAL);
        let finished = events.iter().any(|e| matches!(e, LifecycleEvent::Fatal(_)));
        for event in &events {
            print_event(&session, event);
        }
        if finished {
            break;
        }
    }

    if let Some(state) = manager.stop() {
        log::debug!("Session ended in {}", state);
    }
    if session.dropped_events() > 0 {
        log::warn!("{} events were dropped because the display fell behind", session.dropped_events());
    }
}

fn print_event(session: &MonitorSession, event: &LifecycleEvent) {
    let now = Local::now().format("%H:%M:%S");
    match event {
        LifecycleEvent::SampleReceived(sample) => {
            let contact = match sample.contact_detected {
                Some(false) => "  (no skin contact)",
                _ => "",
            };
            let buffer = session.buffer();
            let range = buffer
                .bpm_range()
                .map(|(min, max)| format!("  [last {}: {}-{}]", buffer.len(), min, max))
                .unwrap_or_default();
            println!("[{}] Heart Rate: {} BPM{}{}", now, sample.bpm, contact, range);
        }
        other => println!("[{}] {}", now, other.status_text()),
    }
}
