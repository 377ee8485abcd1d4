//! Attachment bundle for render passes.

use crate::gpu::descriptor::DescriptorAllocation;
use crate::gpu::device::{CpuDescriptor, Format};
use crate::gpu::resource::Texture;

/// Attachment slots of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentPoint {
    /// Color attachment `N`.
    Color(u8),
    /// The depth-stencil attachment.
    DepthStencil,
}

/// Maximum simultaneously bound color attachments.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// One bound attachment: the texture plus its render-target or
/// depth-stencil view.
#[derive(Debug)]
pub struct Attachment {
    /// The attached texture.
    pub texture: Texture,
    /// RTV or DSV span (one slot) for the texture.
    pub view: DescriptorAllocation,
}

/// A bundle of color attachments and an optional depth-stencil attachment.
///
/// Passes bind the whole bundle through
/// [`crate::gpu::command_list::CommandList::set_render_target`]; the bundle
/// does not transition states itself.
#[derive(Debug, Default)]
pub struct RenderTarget {
    colors: [Option<Attachment>; MAX_COLOR_ATTACHMENTS],
    depth: Option<Attachment>,
}

impl RenderTarget {
    /// Empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a texture. Replacing an existing attachment returns the old
    /// one so its view can be freed.
    pub fn attach(&mut self, point: AttachmentPoint, attachment: Attachment) -> Option<Attachment> {
        match point {
            AttachmentPoint::Color(slot) => {
                debug_assert!((slot as usize) < MAX_COLOR_ATTACHMENTS);
                self.colors[slot as usize].replace(attachment)
            }
            AttachmentPoint::DepthStencil => self.depth.replace(attachment),
        }
    }

    /// The texture bound at `point`, if any.
    #[must_use]
    pub fn texture(&self, point: AttachmentPoint) -> Option<&Texture> {
        match point {
            AttachmentPoint::Color(slot) => {
                self.colors.get(slot as usize)?.as_ref().map(|a| &a.texture)
            }
            AttachmentPoint::DepthStencil => self.depth.as_ref().map(|a| &a.texture),
        }
    }

    /// Bound color attachments, densely packed in slot order.
    pub fn color_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.colors.iter().filter_map(Option::as_ref)
    }

    /// The depth attachment, if bound.
    #[must_use]
    pub fn depth_attachment(&self) -> Option<&Attachment> {
        self.depth.as_ref()
    }

    /// RTV handles of the bound color attachments, in slot order.
    #[must_use]
    pub fn color_views(&self) -> Vec<CpuDescriptor> {
        self.color_attachments().map(|a| a.view.handle(0)).collect()
    }

    /// DSV handle of the depth attachment, if bound.
    #[must_use]
    pub fn depth_view(&self) -> Option<CpuDescriptor> {
        self.depth.as_ref().map(|a| a.view.handle(0))
    }

    /// Formats of the bound color attachments (pipeline description input).
    #[must_use]
    pub fn color_formats(&self) -> Vec<Format> {
        self.color_attachments()
            .map(|a| a.texture.format())
            .collect()
    }

    /// Format of the depth attachment, if bound.
    #[must_use]
    pub fn depth_format(&self) -> Option<Format> {
        self.depth.as_ref().map(|a| a.texture.format())
    }

    /// Size of the first bound attachment.
    #[must_use]
    pub fn size(&self) -> Option<(u32, u32)> {
        self.color_attachments()
            .map(|a| &a.texture)
            .chain(self.depth.as_ref().map(|a| &a.texture))
            .next()
            .map(|t| (t.width(), t.height()))
    }

    /// Detach everything, handing attachments back so views can be freed.
    pub fn drain(&mut self) -> Vec<Attachment> {
        self.colors
            .iter_mut()
            .filter_map(Option::take)
            .chain(self.depth.take())
            .collect()
    }
}
