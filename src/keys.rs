//! Key events forwarded from page script to native listeners.

use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;

pub const KEY_DOWN_BINDING: &str = "webbridge_onKeyDown";
pub const KEY_UP_BINDING: &str = "webbridge_onKeyUp";
pub const ENABLE_KEY_EVENTS_BINDING: &str = "webbridge_enableKeyEvents";

pub trait KeyListener {
    fn on_key_down(&self, _key: &str) {}
    fn on_key_up(&self, _key: &str) {}
}

#[derive(Default)]
pub struct KeyListeners {
    listeners: RefCell<Vec<Rc<dyn KeyListener>>>,
}

impl KeyListeners {
    pub fn add(&self, listener: Rc<dyn KeyListener>) {
        let mut listeners = self.listeners.borrow_mut();
        if !listeners.iter().any(|existing| same_listener(existing, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Rc<dyn KeyListener>) {
        self.listeners
            .borrow_mut()
            .retain(|existing| !same_listener(existing, listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }

    pub fn key_down(&self, key: &str) {
        for listener in self.snapshot() {
            listener.on_key_down(key);
        }
    }

    pub fn key_up(&self, key: &str) {
        for listener in self.snapshot() {
            listener.on_key_up(key);
        }
    }

    // listeners may add or remove listeners while being notified
    fn snapshot(&self) -> Vec<Rc<dyn KeyListener>> {
        self.listeners.borrow().clone()
    }
}

fn same_listener(a: &Rc<dyn KeyListener>, b: &Rc<dyn KeyListener>) -> bool {
    ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
