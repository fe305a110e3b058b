use js_sys::Reflect;
use serde::{Deserialize, Serialize};
use std::io;
use wasm_bindgen::prelude::wasm_bindgen;
use wasm_bindgen::JsValue;
use web_sys::console;

#[wasm_bindgen]
extern "C" {
    static performance: web_sys::Performance;

    fn postMessage(value: &JsValue);
}

pub fn now() -> f64 {
    performance.now()
}

#[derive(Deserialize)]
#[serde(tag = "cmd")]
pub enum Request {
    RunSolve {
        tiles: String,
        words: String,
        table: Vec<(String, i32)>,
        no_discard: bool,
        common_only: bool,
        current_longest: Option<usize>,
        current_most: Option<usize>,
        longest_bonus: i32,
        most_bonus: i32,
    },
}

#[derive(Serialize)]
#[serde(tag = "cmd")]
pub enum Reply {
    UpdateStatus { message: String },
    ReportPlay { play: crate::BestPlay },
}

impl Reply {
    pub fn post(&self) {
        postMessage(&JsValue::from_serde(self).unwrap());
    }
}

#[wasm_bindgen]
pub fn init() {
    console_error_panic_hook::set_once();
}

#[wasm_bindgen]
pub fn onmessage(e: &JsValue) {
    if let Err(err) = handle_message(&Reflect::get(e, &"data".into()).unwrap()) {
        update_status(format!("Error: {}", err));
    }
}

fn handle_message(data: &JsValue) -> io::Result<()> {
    match data.into_serde()? {
        Request::RunSolve {
            tiles,
            words,
            table,
            no_discard,
            common_only,
            current_longest,
            current_most,
            longest_bonus,
            most_bonus,
        } => {
            let options = crate::Options {
                no_discard,
                common_only,
                current_longest,
                current_most,
                longest_bonus,
                most_bonus,
                ..Default::default()
            };
            crate::solve(&tiles, &words, table, &options, &ConsoleLog)
        }
    }
}

pub struct ConsoleLog;

impl crate::Log for ConsoleLog {
    fn log(&self, message: &str) {
        console::log_1(&message.into());
    }
}

pub fn log(message: &str) {
    console::log_1(&message.into());
}

pub fn update_status(message: String) {
    Reply::UpdateStatus { message }.post();
}

#[derive(Debug)]
pub struct Timer {
    name: &'static str,
}

impl From<&'static str> for Timer {
    fn from(name: &'static str) -> Self {
        console::time_with_label(name);
        Self { name }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        console::time_end_with_label(self.name);
    }
}
