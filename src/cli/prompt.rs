//! The startup menus from `ClientMain.cpp`: login-vs-signup, a password
//! confirmation on signup, and the post-connect monitor/restore menu with
//! its destructive-action confirmation. None of this is reachable from
//! the core client/server modules: the binary calls these, builds the
//! value objects, and hands them to `client::Client`.

use std::io::{self, Write};

use crate::types::{Credentials, StartupMode};

fn read_line(prompt: &str) -> String {
    print!("{prompt}");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().read_line(&mut line).ok();
    line.trim().to_string()
}

/// Ask whether this is a login or a signup, then the matching credentials.
/// Signup requires the password to be typed twice and non-empty.
pub fn ask_credentials() -> Credentials {
    loop {
        let choice = read_line("To authenticate insert 0, to signup insert 1: ");
        match choice.as_str() {
            "0" => {
                let user = read_line("Username: ");
                let pass = read_line("Password: ");
                return Credentials { user, pass, is_new_user: false };
            }
            "1" => {
                let user = read_line("Username: ");
                loop {
                    let pass = read_line("Password: ");
                    let confirm = read_line("Confirm password: ");
                    if pass.is_empty() || pass != confirm {
                        println!("Error on password, retry");
                        continue;
                    }
                    return Credentials { user, pass, is_new_user: true };
                }
            }
            _ => println!("Please enter 0 or 1"),
        }
    }
}

/// The post-connect menu for an existing user: monitor only, restore then
/// exit, or restore then monitor. Destructive options require a Y/n
/// confirmation since they wipe the local tree first.
pub fn ask_startup_mode() -> StartupMode {
    loop {
        let choice = read_line(
            "---------------------\n\
             - 0 to start monitoring\n\
             - 1 to restore data from remote server\n\
             - 2 to restore and start monitoring\n\
             Select an option: ",
        );
        let mode = match choice.as_str() {
            "0" => StartupMode::Monitor,
            "1" => StartupMode::Restore,
            "2" => StartupMode::RestoreThenMonitor,
            _ => {
                println!("Please enter 0, 1 or 2");
                continue;
            }
        };
        if matches!(mode, StartupMode::Restore | StartupMode::RestoreThenMonitor) {
            let confirm = read_line("The current content of the folder will be deleted, are you sure? (Y/n)\n");
            if confirm != "Y" {
                continue;
            }
        }
        return mode;
    }
}

/// Block until the user types `exit` on its own line.
pub fn wait_for_exit_command() {
    loop {
        let line = read_line("Write exit to stop: ");
        if line == "exit" {
            return;
        }
    }
}
