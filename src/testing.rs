//! In-memory runtime and registry used by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};

use crate::docker::{
    self, ContainerRuntime, ContainerSnapshot, DockerError, EventStream, LifecycleEvent,
    ensure_tagged,
};
use crate::skydns::{self, Registry, RegistryError, ServiceDescriptor};

pub fn redis_snapshot() -> ContainerSnapshot {
    ContainerSnapshot {
        id: "abcdef0123456789".to_string(),
        image: "crosbymichael/redis:latest".to_string(),
        name: "redis1".to_string(),
        ip_address: "192.168.1.10".to_string(),
        running: true,
        env: Vec::new(),
    }
}

pub fn snapshot(id: &str, image: &str, name: &str, ip_address: &str) -> ContainerSnapshot {
    ContainerSnapshot {
        id: id.to_string(),
        image: image.to_string(),
        name: name.to_string(),
        ip_address: ip_address.to_string(),
        running: true,
        env: Vec::new(),
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerSnapshot>>,
    /// Image names the listing reports instead of the configured one.
    listed_images: Mutex<HashMap<String, String>>,
    events: Mutex<Vec<docker::Result<LifecycleEvent>>>,
    fail_fetches: AtomicBool,
    fail_list: AtomicBool,
    pub fetches: AtomicUsize,
}

impl FakeRuntime {
    pub fn with(containers: impl IntoIterator<Item = ContainerSnapshot>) -> Self {
        let runtime = Self::default();
        for container in containers {
            runtime.insert(container);
        }
        runtime
    }

    pub fn insert(&self, container: ContainerSnapshot) {
        self.containers
            .lock()
            .expect("poisoned")
            .insert(container.id.clone(), container);
    }

    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(container) = self.containers.lock().expect("poisoned").get_mut(id) {
            container.running = running;
        }
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().expect("poisoned").remove(id);
    }

    /// Lists `id` under `image`, the way the daemon lists an untagged image by its id.
    pub fn list_as(&self, id: &str, image: &str) {
        self.listed_images
            .lock()
            .expect("poisoned")
            .insert(id.to_string(), image.to_string());
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: docker::Result<LifecycleEvent>) {
        self.events.lock().expect("poisoned").push(event);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> docker::Result<Vec<ContainerSnapshot>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DockerError::Transport("connection refused".to_string()));
        }
        let mut containers: Vec<_> = self
            .containers
            .lock()
            .expect("poisoned")
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect();
        let listed_images = self.listed_images.lock().expect("poisoned");
        for container in &mut containers {
            if let Some(image) = listed_images.get(&container.id) {
                container.image = image.clone();
            }
        }
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn fetch_container(
        &self,
        id: &str,
        expected_image: &str,
    ) -> docker::Result<ContainerSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(DockerError::Transport("connection refused".to_string()));
        }
        // The daemon resolves unique id prefixes
        let mut snapshot = self
            .containers
            .lock()
            .expect("poisoned")
            .values()
            .find(|c| c.id.starts_with(id))
            .cloned()
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        ensure_tagged(expected_image, &snapshot.image)?;
        if !expected_image.is_empty() {
            snapshot.image = expected_image.to_string();
        }
        Ok(snapshot)
    }

    fn events(&self) -> EventStream {
        let events: Vec<_> = self.events.lock().expect("poisoned").drain(..).collect();
        stream::iter(events).boxed()
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    services: Mutex<HashMap<String, ServiceDescriptor>>,
    fail_updates: AtomicBool,
    fail_adds: AtomicBool,
    delete_delay: Mutex<Duration>,
    pub adds: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeRegistry {
    pub fn get(&self, key: &str) -> Option<ServiceDescriptor> {
        self.services.lock().expect("poisoned").get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.lock().expect("poisoned").len()
    }

    pub fn insert(&self, key: &str, descriptor: ServiceDescriptor) {
        self.services
            .lock()
            .expect("poisoned")
            .insert(key.to_string(), descriptor);
    }

    pub fn evict(&self, key: &str) {
        self.services.lock().expect("poisoned").remove(key);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    /// Makes every delete take `delay` before the entry is removed.
    pub fn slow_deletes(&self, delay: Duration) {
        *self.delete_delay.lock().expect("poisoned") = delay;
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn add(&self, key: &str, descriptor: &ServiceDescriptor) -> skydns::Result<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(RegistryError::Transport("connection refused".to_string()));
        }
        let mut services = self.services.lock().expect("poisoned");
        if services.contains_key(key) {
            return Err(RegistryError::Conflict(key.to_string()));
        }
        services.insert(key.to_string(), descriptor.clone());
        Ok(())
    }

    async fn update(&self, key: &str, ttl_seconds: u32) -> skydns::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RegistryError::Transport("connection refused".to_string()));
        }
        match self.services.lock().expect("poisoned").get_mut(key) {
            Some(service) => {
                service.ttl_seconds = ttl_seconds;
                Ok(())
            }
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> skydns::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delete_delay.lock().expect("poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.services.lock().expect("poisoned").remove(key) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }
}
