//! Device memory, images, buffers and descriptor pool sizing

use ash::vk;

/// A device memory allocation made through the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    raw: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    flags: vk::MemoryPropertyFlags,
}

impl Memory {
    pub(crate) fn new(
        raw: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            raw,
            size,
            memory_type_index,
            flags,
        }
    }

    /// Raw handle
    pub fn raw(&self) -> vk::DeviceMemory {
        self.raw
    }

    /// Allocation size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Memory type the allocation came from
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Property flags of that memory type
    pub fn flags(&self) -> vk::MemoryPropertyFlags {
        self.flags
    }
}

/// Find a memory type allowed by `type_bits` for `flags`
///
/// A type whose flags equal `flags` exactly wins over the first type whose
/// flags merely contain them, so plain device-local requests stay out of
/// host-visible heaps when the device offers both.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    let allowed: Vec<(u32, vk::MemoryPropertyFlags)> = (0..count)
        .filter(|&i| type_bits & (1 << i) != 0)
        .map(|i| (i, properties.memory_types[i as usize].property_flags))
        .collect();

    allowed
        .iter()
        .find(|&&(_, type_flags)| type_flags == flags)
        .or_else(|| allowed.iter().find(|&&(_, type_flags)| type_flags.contains(flags)))
        .map(|&(i, _)| i)
}

/// Shape of a 2D image created by the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect used for barriers and views
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    /// Color render target that can later be sampled
    pub fn color(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Depth attachment that can later be sampled
    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::DEPTH,
        }
    }

    /// Replace the usage flags
    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// True for depth or stencil images
    pub fn is_depth(&self) -> bool {
        self.aspect
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }
}

/// An image and, unless owned by a swap object, its memory
#[derive(Debug, PartialEq, Eq)]
pub struct Image {
    raw: vk::Image,
    desc: ImageDesc,
    memory: Option<Memory>,
}

impl Image {
    pub(crate) fn owned(raw: vk::Image, desc: ImageDesc, memory: Memory) -> Self {
        Self {
            raw,
            desc,
            memory: Some(memory),
        }
    }

    /// Wrap an image owned by something else, such as a swap object
    pub fn external(raw: vk::Image, desc: ImageDesc) -> Self {
        Self { raw, desc, memory: None }
    }

    /// Raw handle
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    /// Creation parameters
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Backing memory, `None` for external images
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }
}

/// Shape of a buffer created by the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Usage flags
    pub usage: vk::BufferUsageFlags,
    /// Required memory properties
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl BufferDesc {
    /// Host-visible staging buffer
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    /// Device-local buffer filled through transfers
    pub fn device_local(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }
}

/// A buffer with its memory
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    raw: vk::Buffer,
    desc: BufferDesc,
    memory: Memory,
}

impl Buffer {
    pub(crate) fn new(raw: vk::Buffer, desc: BufferDesc, memory: Memory) -> Self {
        Self { raw, desc, memory }
    }

    /// Raw handle
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Creation parameters
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Backing memory
    pub fn memory(&self) -> &Memory {
        &self.memory
    }
}

/// Pool-size query answered by the shader reflection layer
pub trait DescriptorLayoutSource {
    /// Descriptors of each type needed by one set of every layout
    fn descriptor_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize>;

    /// Set layouts, in set-index order
    fn descriptor_set_layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        Vec::new()
    }

    /// Sets needed per copy
    fn descriptor_set_count(&self) -> u32 {
        u32::try_from(self.descriptor_set_layouts().len().max(1)).unwrap_or(u32::MAX)
    }
}

/// `copies` copies of every set of a layout source, allocated from one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorArray {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    sets_per_copy: usize,
}

impl DescriptorArray {
    pub(crate) fn new(pool: vk::DescriptorPool, sets: Vec<vk::DescriptorSet>, sets_per_copy: usize) -> Self {
        Self {
            pool,
            sets,
            sets_per_copy,
        }
    }

    /// Pool the sets were allocated from
    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Number of copies
    pub fn copies(&self) -> usize {
        self.sets.len() / self.sets_per_copy.max(1)
    }

    /// Sets of one copy, in set-index order
    pub fn copy(&self, index: usize) -> Option<&[vk::DescriptorSet]> {
        self.sets.chunks(self.sets_per_copy.max(1)).nth(index)
    }

    /// All sets, copy by copy
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }
}

/// Multiply pool sizes by the number of copies, merging duplicate types
pub fn scale_pool_sizes(sizes: &[vk::DescriptorPoolSize], copies: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut scaled: Vec<vk::DescriptorPoolSize> = Vec::with_capacity(sizes.len());
    for size in sizes {
        let count = size.descriptor_count.saturating_mul(copies);
        match scaled.iter_mut().find(|existing| existing.ty == size.ty) {
            Some(existing) => existing.descriptor_count = existing.descriptor_count.saturating_add(count),
            None => scaled.push(vk::DescriptorPoolSize {
                ty: size.ty,
                descriptor_count: count,
            }),
        }
    }
    scaled.retain(|size| size.descriptor_count > 0);
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_exact_match_beats_superset() {
        use vk::MemoryPropertyFlags as F;
        let props = properties(&[F::DEVICE_LOCAL | F::HOST_VISIBLE, F::DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&props, !0, F::DEVICE_LOCAL), Some(1));
    }

    #[test]
    fn test_superset_fallback() {
        use vk::MemoryPropertyFlags as F;
        let props = properties(&[F::DEVICE_LOCAL, F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED]);
        assert_eq!(find_memory_type(&props, !0, F::HOST_VISIBLE | F::HOST_COHERENT), Some(1));
    }

    #[test]
    fn test_type_bits_respected() {
        use vk::MemoryPropertyFlags as F;
        let props = properties(&[F::DEVICE_LOCAL, F::DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&props, 0b10, F::DEVICE_LOCAL), Some(1));
        assert_eq!(find_memory_type(&props, 0, F::DEVICE_LOCAL), None);
    }

    #[test]
    fn test_scale_pool_sizes_merges_types() {
        let sizes = [
            vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 2 },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: 1 },
            vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: 1 },
        ];
        let scaled = scale_pool_sizes(&sizes, 3);
        assert_eq!(scaled.len(), 2);
        assert_eq!(scaled[0].descriptor_count, 9);
        assert_eq!(scaled[1].descriptor_count, 3);
    }

    #[test]
    fn test_depth_desc() {
        let desc = ImageDesc::depth(vk::Extent2D { width: 4, height: 4 }, vk::Format::D32_SFLOAT);
        assert!(desc.is_depth());
        assert!(!ImageDesc::color(desc.extent, vk::Format::R8G8B8A8_UNORM).is_depth());
    }
}
