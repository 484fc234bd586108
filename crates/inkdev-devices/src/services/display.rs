/*!
 * Display services.
 *
 * A discrete display is the screen of a signature tablet: the host draws on
 * it, clears it and decides where the pen leaves ink. A desktop display is a
 * pen display attached to the desktop; the host chooses which part of the
 * desktop the tablet surface maps onto.
 *
 * Areas passed in are clamped into the display rather than rejected.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use inkdev_core::types::{object, Value};

use super::ServiceContext;
use crate::area::{AreaEditor, Rect};
use crate::error::{DeviceError, Result};
use crate::link::Command;
use crate::properties::mismatch;

/// An opaque RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
}

impl Color {
    /// Black
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    /// White
    pub const WHITE: Color = Color::rgb(0xFF, 0xFF, 0xFF);

    /// Create a color
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl From<Color> for Value {
    fn from(color: Color) -> Self {
        object([
            ("R", Value::from(color.r)),
            ("G", Value::from(color.g)),
            ("B", Value::from(color.b)),
        ])
    }
}

impl TryFrom<&Value> for Color {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self> {
        let channel = |name: &str| {
            value
                .field(name)
                .and_then(Value::as_u32)
                .and_then(|c| u8::try_from(c).ok())
                .ok_or_else(|| mismatch("Color", value))
        };
        Ok(Color::rgb(channel("R")?, channel("G")?, channel("B")?))
    }
}

/// Pixel format of a discrete display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// One bit per pixel, black and white
    Mono1,
    /// 16-bit color
    Rgb565,
    /// 24-bit color
    Rgb24,
}

impl PixelFormat {
    /// Whether colors are meaningless on this display
    pub fn is_monochrome(&self) -> bool {
        matches!(self, PixelFormat::Mono1)
    }
}

/// An RGBA image to draw on a discrete display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Image {
    /// Bytes per pixel
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Create an image from tightly packed RGBA rows
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self> {
        let pixels = pixels.into();
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(Self::BYTES_PER_PIXEL));
        if width == 0 || height == 0 || expected != Some(pixels.len()) {
            return Err(DeviceError::other(format!(
                "image {}x{} does not match {} bytes of pixel data",
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// A single color image
    pub fn filled(width: u32, height: u32, color: Color) -> Result<Self> {
        let count = (width as usize)
            .checked_mul(height as usize)
            .filter(|n| n.checked_mul(Self::BYTES_PER_PIXEL).is_some())
            .ok_or_else(|| DeviceError::other(format!("image {}x{} is too large", width, height)))?;
        let pixels = [color.r, color.g, color.b, 0xFF].repeat(count);
        Self::new(width, height, pixels)
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGBA pixel data
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// The whole image as a rectangle
    pub fn area(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }
}

/// Static description of a discrete display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteDisplayInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub pixel_format: PixelFormat,
    /// Whether the pen can leave ink on the display
    pub supports_inking: bool,
    /// Whether inking and clearing can be restricted to an area
    pub supports_area_update: bool,
}

/// Static description of a desktop display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopDisplayInfo {
    /// Whether the tablet is built into the display
    pub is_integrated: bool,
    /// Monitor id
    pub id: String,
    /// The monitor's rectangle in desktop pixels
    pub screen_pixels: Rect,
}

#[derive(Debug)]
struct DiscreteInner {
    ctx: ServiceContext,
    info: DiscreteDisplayInfo,
    inking: AtomicBool,
}

/// Draw on and control inking on a signature tablet screen
#[derive(Debug, Clone)]
pub struct DiscreteDisplayService {
    inner: Arc<DiscreteInner>,
}

impl DiscreteDisplayService {
    pub(crate) fn new(ctx: ServiceContext, info: DiscreteDisplayInfo) -> Self {
        Self {
            inner: Arc::new(DiscreteInner {
                ctx,
                info,
                inking: AtomicBool::new(false),
            }),
        }
    }

    /// Display description
    pub fn info(&self) -> &DiscreteDisplayInfo {
        &self.inner.info
    }

    /// Whether inking was last enabled
    pub fn is_inking(&self) -> bool {
        self.inner.inking.load(Ordering::SeqCst)
    }

    /// An editor over the whole display, for building areas interactively
    pub fn area_editor(&self) -> AreaEditor {
        AreaEditor::full(self.inner.info.width, self.inner.info.height)
    }

    fn full_area(&self) -> Rect {
        Rect::from_size(self.inner.info.width, self.inner.info.height)
    }

    /// `area` clamped into the display, or the whole display when the device
    /// cannot restrict updates to an area
    fn target_area(&self, area: Option<Rect>) -> Rect {
        let info = &self.inner.info;
        match area {
            Some(area) if info.supports_area_update => area.clamped_to(info.width, info.height),
            _ => self.full_area(),
        }
    }

    /// Read the ink color; monochrome displays always ink in black
    pub async fn ink_color(&self, cancel: &CancellationToken) -> Result<Color> {
        if self.inner.info.pixel_format.is_monochrome() {
            return Ok(Color::BLACK);
        }
        let value = self.inner.ctx.execute(Command::GetInkColor, cancel).await?;
        Color::try_from(&value)
    }

    /// Set the ink color; ignored on monochrome displays
    pub async fn set_ink_color(&self, color: Color, cancel: &CancellationToken) -> Result<()> {
        if self.inner.info.pixel_format.is_monochrome() {
            debug!("Ignoring ink color on monochrome display");
            return Ok(());
        }
        self.inner
            .ctx
            .execute(Command::SetInkColor(color), cancel)
            .await?;
        Ok(())
    }

    /// Let the pen leave ink inside `area`, or the whole display for `None`
    ///
    /// Returns the area actually used.
    pub async fn enable_inking(&self, area: Option<Rect>, cancel: &CancellationToken) -> Result<Rect> {
        if !self.inner.info.supports_inking {
            return Err(DeviceError::invalid_state("display does not support inking"));
        }
        let area = self.target_area(area);
        self.inner
            .ctx
            .execute(Command::EnableInking(area), cancel)
            .await?;
        self.inner.inking.store(true, Ordering::SeqCst);
        info!("Inking enabled in {}", area);
        Ok(area)
    }

    /// Stop the pen from leaving ink
    pub async fn disable_inking(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.ctx.execute(Command::DisableInking, cancel).await?;
        self.inner.inking.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Fill `area` (or the whole display) with `color`
    ///
    /// Monochrome displays always clear to white. Returns the area cleared.
    pub async fn clear_screen(
        &self,
        color: Color,
        area: Option<Rect>,
        cancel: &CancellationToken,
    ) -> Result<Rect> {
        let color = if self.inner.info.pixel_format.is_monochrome() {
            Color::WHITE
        } else {
            color
        };
        let area = self.target_area(area);
        self.inner
            .ctx
            .execute(Command::ClearScreen { color, area }, cancel)
            .await?;
        Ok(area)
    }

    /// Draw the `source` part of `image` (or all of it) into `destination`
    /// (or the whole display)
    ///
    /// The source is clamped to the image and the destination to the
    /// display. Returns the clamped `(source, destination)` pair.
    pub async fn draw_image(
        &self,
        image: &Image,
        source: Option<Rect>,
        destination: Option<Rect>,
        cancel: &CancellationToken,
    ) -> Result<(Rect, Rect)> {
        let source = source
            .map(|s| s.clamped_to(image.width(), image.height()))
            .unwrap_or_else(|| image.area());
        let destination = self.target_area(destination);
        self.inner
            .ctx
            .execute(
                Command::DrawImage {
                    image: image.clone(),
                    source,
                    destination,
                },
                cancel,
            )
            .await?;
        Ok((source, destination))
    }
}

#[derive(Debug)]
struct DesktopInner {
    ctx: ServiceContext,
    info: DesktopDisplayInfo,
}

/// Control how a pen display maps onto the desktop
#[derive(Debug, Clone)]
pub struct DesktopDisplayService {
    inner: Arc<DesktopInner>,
}

impl DesktopDisplayService {
    pub(crate) fn new(ctx: ServiceContext, info: DesktopDisplayInfo) -> Self {
        Self {
            inner: Arc::new(DesktopInner { ctx, info }),
        }
    }

    /// Display description
    pub fn info(&self) -> &DesktopDisplayInfo {
        &self.inner.info
    }

    /// Whether the tablet is built into the display
    pub fn is_integrated(&self) -> bool {
        self.inner.info.is_integrated
    }

    /// Monitor id
    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    /// The monitor's rectangle in desktop pixels
    pub fn screen_pixels(&self) -> Rect {
        self.inner.info.screen_pixels
    }

    /// The desktop area the tablet maps onto
    pub async fn mapped_pixels(&self, cancel: &CancellationToken) -> Result<Rect> {
        let value = self
            .inner
            .ctx
            .execute(Command::GetMappedPixels, cancel)
            .await?;
        Rect::try_from(&value)
    }

    /// Map the tablet onto `area`, clamped into the monitor
    ///
    /// Returns the area actually applied.
    pub async fn set_mapped_pixels(&self, area: Rect, cancel: &CancellationToken) -> Result<Rect> {
        let applied = clamp_to_screen(area, self.inner.info.screen_pixels);
        self.inner
            .ctx
            .execute(Command::SetMappedPixels(applied), cancel)
            .await?;
        Ok(applied)
    }

    /// Whether the mapping follows the cursor across monitors
    pub async fn track_cursor(&self, cancel: &CancellationToken) -> Result<bool> {
        let value = self.inner.ctx.execute(Command::GetTrackCursor, cancel).await?;
        value.as_bool().ok_or_else(|| {
            DeviceError::InvalidValueType(
                "TrackCursor".to_string(),
                "bool".to_string(),
                value.kind().to_string(),
            )
        })
    }

    /// Set whether the mapping follows the cursor
    pub async fn set_track_cursor(&self, enabled: bool, cancel: &CancellationToken) -> Result<()> {
        self.inner
            .ctx
            .execute(Command::SetTrackCursor(enabled), cancel)
            .await?;
        Ok(())
    }
}

/// Clamp `area`, given in desktop pixels, into `screen`, which may not start at the origin
fn clamp_to_screen(area: Rect, screen: Rect) -> Rect {
    let local = Rect::new(
        area.x.saturating_sub(screen.x),
        area.y.saturating_sub(screen.y),
        area.width,
        area.height,
    );
    let width = u32::try_from(screen.width.max(1)).unwrap_or(1);
    let height = u32::try_from(screen.height.max(1)).unwrap_or(1);
    let clamped = local.clamped_to(width, height);
    Rect::new(
        clamped.x.saturating_add(screen.x),
        clamped.y.saturating_add(screen.y),
        clamped.width,
        clamped.height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DeviceDescriptor, DeviceModel, TransportKind};
    use crate::device::InkDevice;
    use crate::link::ServiceProfile;
    use crate::status::DeviceStatus;
    use crate::transports::sim::{SimController, SimulatedDevice};
    use inkdev_core::config::FileTransferConfig;

    fn tablet(profile: ServiceProfile) -> (InkDevice, SimController) {
        let descriptor = DeviceDescriptor::new("stu-1", "STU-540", TransportKind::Usb, DeviceModel::Stu);
        let (link, ctl) = SimulatedDevice::new(descriptor).with_service(profile).open_link();
        let events = link.take_events().unwrap();
        let device =
            InkDevice::attach(link, events, DeviceStatus::Idle, &FileTransferConfig::default()).unwrap();
        (device, ctl)
    }

    fn screen(pixel_format: PixelFormat, supports_area_update: bool) -> ServiceProfile {
        ServiceProfile::DiscreteDisplay(DiscreteDisplayInfo {
            width: 320,
            height: 200,
            pixel_format,
            supports_inking: true,
            supports_area_update,
        })
    }

    #[test]
    fn test_color_value() {
        let color = Color::rgb(1, 2, 3);
        assert_eq!(Color::try_from(&Value::from(color)).unwrap(), color);
        assert!(Color::try_from(&object([("R", Value::from(300))])).is_err());
    }

    #[test]
    fn test_image_size_check() {
        assert!(Image::new(2, 2, vec![0u8; 16]).is_ok());
        assert!(Image::new(2, 2, vec![0u8; 15]).is_err());
        assert!(Image::new(0, 2, Vec::<u8>::new()).is_err());
        let image = Image::filled(3, 1, Color::WHITE).unwrap();
        assert_eq!(image.pixels().len(), 12);
        assert_eq!(image.area(), Rect::new(0, 0, 3, 1));
    }

    #[test]
    fn test_clamp_to_offset_screen() {
        let screen = Rect::new(1920, 0, 1280, 1024);
        assert_eq!(
            clamp_to_screen(Rect::new(0, 0, 5000, 5000), screen),
            Rect::new(1920, 0, 1280, 1024)
        );
        assert_eq!(
            clamp_to_screen(Rect::new(2000, 100, 200, 200), screen),
            Rect::new(2000, 100, 200, 200)
        );
        assert_eq!(
            clamp_to_screen(Rect::new(3100, 0, 200, 200), screen),
            Rect::new(3100, 0, 100, 200)
        );
    }

    #[test]
    fn test_filled_image_overflow() {
        assert!(Image::filled(u32::MAX, u32::MAX, Color::BLACK).is_err());
    }

    #[tokio::test]
    async fn test_areas_are_clamped_before_sending() {
        let (device, ctl) = tablet(screen(PixelFormat::Rgb24, true));
        let display = device.discrete_display().unwrap();
        let cancel = CancellationToken::new();
        let overflowing = Rect::new(300, 150, 100, 100);
        let clamped = Rect::new(300, 150, 20, 50);

        assert_eq!(display.enable_inking(Some(overflowing), &cancel).await.unwrap(), clamped);
        assert!(display.is_inking());
        let red = Color::rgb(0xFF, 0, 0);
        assert_eq!(display.clear_screen(red, Some(overflowing), &cancel).await.unwrap(), clamped);

        let image = Image::filled(4, 4, red).unwrap();
        let (source, destination) = display
            .draw_image(&image, Some(Rect::new(2, 2, 10, 10)), Some(overflowing), &cancel)
            .await
            .unwrap();
        assert_eq!(source, Rect::new(2, 2, 2, 2));
        assert_eq!(destination, clamped);

        assert_eq!(
            ctl.commands(),
            vec![
                Command::EnableInking(clamped),
                Command::ClearScreen { color: red, area: clamped },
                Command::DrawImage {
                    image,
                    source: Rect::new(2, 2, 2, 2),
                    destination: clamped,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_full_display_without_area_update() {
        let (device, ctl) = tablet(screen(PixelFormat::Rgb24, false));
        let display = device.discrete_display().unwrap();
        let cancel = CancellationToken::new();
        let full = Rect::new(0, 0, 320, 200);

        let area = display.enable_inking(Some(Rect::new(10, 10, 50, 50)), &cancel).await.unwrap();
        assert_eq!(area, full);
        let area = display
            .clear_screen(Color::WHITE, Some(Rect::new(10, 10, 50, 50)), &cancel)
            .await
            .unwrap();
        assert_eq!(area, full);
        assert_eq!(ctl.commands()[0], Command::EnableInking(full));
    }

    #[tokio::test]
    async fn test_ink_color_round_trip() {
        let (device, ctl) = tablet(screen(PixelFormat::Rgb565, true));
        let display = device.discrete_display().unwrap();
        let cancel = CancellationToken::new();
        let blue = Color::rgb(0, 0, 0xFF);

        display.set_ink_color(blue, &cancel).await.unwrap();
        assert_eq!(ctl.ink_color(), blue);
        assert_eq!(display.ink_color(&cancel).await.unwrap(), blue);
    }

    #[tokio::test]
    async fn test_monochrome_ignores_colors() {
        let (device, ctl) = tablet(screen(PixelFormat::Mono1, true));
        let display = device.discrete_display().unwrap();
        let cancel = CancellationToken::new();

        display.set_ink_color(Color::rgb(0, 0xFF, 0), &cancel).await.unwrap();
        assert_eq!(display.ink_color(&cancel).await.unwrap(), Color::BLACK);
        display
            .clear_screen(Color::rgb(0, 0xFF, 0), None, &cancel)
            .await
            .unwrap();
        assert_eq!(
            ctl.commands(),
            vec![Command::ClearScreen {
                color: Color::WHITE,
                area: Rect::new(0, 0, 320, 200),
            }]
        );
    }

    #[tokio::test]
    async fn test_desktop_mapping_and_cursor_tracking() {
        let (device, _ctl) = tablet(ServiceProfile::DesktopDisplay(DesktopDisplayInfo {
            is_integrated: true,
            id: "DISPLAY2".to_string(),
            screen_pixels: Rect::new(1920, 0, 1280, 1024),
        }));
        let display = device.desktop_display().unwrap();
        let cancel = CancellationToken::new();
        assert!(display.is_integrated());
        assert_eq!(display.id(), "DISPLAY2");

        let applied = display
            .set_mapped_pixels(Rect::new(3100, 0, 200, 200), &cancel)
            .await
            .unwrap();
        assert_eq!(applied, Rect::new(3100, 0, 100, 200));
        assert_eq!(display.mapped_pixels(&cancel).await.unwrap(), applied);

        assert!(!display.track_cursor(&cancel).await.unwrap());
        display.set_track_cursor(true, &cancel).await.unwrap();
        assert!(display.track_cursor(&cancel).await.unwrap());
    }
}
