//! Scriptable fake channel gateway.
//!
//! Defaults to a fully permissive, always-pinned channel. Tests queue
//! responses to script failures; queued responses are consumed in order and
//! the default behavior resumes once the queue is empty.

use adpostd::gateway::{ChannelGateway, ChannelPermissions, GatewayError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct FakeGateway {
    permissions: Mutex<ChannelPermissions>,
    post_queue: Mutex<VecDeque<Result<i64, GatewayError>>>,
    pin_queue: Mutex<VecDeque<Result<(), GatewayError>>>,
    pinned_queue: Mutex<VecDeque<Result<bool, GatewayError>>>,
    next_message_id: AtomicI64,
    pub post_calls: AtomicUsize,
    pub pin_calls: AtomicUsize,
    pub pinned_calls: AtomicUsize,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            permissions: Mutex::new(ChannelPermissions {
                is_admin: true,
                can_post: true,
                can_pin: true,
            }),
            post_queue: Mutex::new(VecDeque::new()),
            pin_queue: Mutex::new(VecDeque::new()),
            pinned_queue: Mutex::new(VecDeque::new()),
            next_message_id: AtomicI64::new(9000),
            post_calls: AtomicUsize::new(0),
            pin_calls: AtomicUsize::new(0),
            pinned_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_permissions(&self, permissions: ChannelPermissions) {
        *self.permissions.lock().unwrap() = permissions;
    }

    pub fn queue_post(&self, result: Result<i64, GatewayError>) {
        self.post_queue.lock().unwrap().push_back(result);
    }

    pub fn queue_pin(&self, result: Result<(), GatewayError>) {
        self.pin_queue.lock().unwrap().push_back(result);
    }

    pub fn queue_pinned(&self, result: Result<bool, GatewayError>) {
        self.pinned_queue.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ChannelGateway for FakeGateway {
    async fn check_permissions(
        &self,
        _channel_external_id: &str,
    ) -> Result<ChannelPermissions, GatewayError> {
        Ok(*self.permissions.lock().unwrap())
    }

    async fn post(&self, _channel_external_id: &str, _text: &str) -> Result<i64, GatewayError> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.post_queue.lock().unwrap().pop_front() {
            return result;
        }
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn pin(&self, _channel_external_id: &str, _message_id: i64) -> Result<(), GatewayError> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.pin_queue.lock().unwrap().pop_front() {
            return result;
        }
        Ok(())
    }

    async fn is_still_pinned(
        &self,
        _channel_external_id: &str,
        _message_id: i64,
    ) -> Result<bool, GatewayError> {
        self.pinned_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.pinned_queue.lock().unwrap().pop_front() {
            return result;
        }
        Ok(true)
    }
}
