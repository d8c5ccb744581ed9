use ash::vk::{self, Handle};
use slotmap::{Key, new_key_type};

new_key_type! { pub struct ImageKey; }
new_key_type! { pub struct BufferKey; }
new_key_type! { pub struct SemaphoreKey; }
new_key_type! { pub struct CommandBufferKey; }

pub(crate) fn raw<K: Key>(key: K) -> u64 {
    key.data().as_ffi()
}

pub(crate) fn image(key: ImageKey) -> vk::Image {
    vk::Image::from_raw(raw(key))
}

pub(crate) fn image_view(key: ImageKey) -> vk::ImageView {
    vk::ImageView::from_raw(raw(key))
}

pub(crate) fn buffer(key: BufferKey) -> vk::Buffer {
    vk::Buffer::from_raw(raw(key))
}

pub(crate) fn semaphore(key: SemaphoreKey) -> vk::Semaphore {
    vk::Semaphore::from_raw(raw(key))
}
