use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
	pub x: f32,
	pub y: f32,
}

impl Point {
	pub const fn new(x: f32, y: f32) -> Self {
		Self { x, y }
	}
}

/// Axis-aligned rectangle in output-layout coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rectangle {
	pub x: i32,
	pub y: i32,
	pub width: u32,
	pub height: u32,
}

impl Rectangle {
	pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
		Self {
			x,
			y,
			width,
			height,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}

	fn right(&self) -> i64 {
		self.x as i64 + self.width as i64
	}

	fn bottom(&self) -> i64 {
		self.y as i64 + self.height as i64
	}

	pub fn contains(&self, point: Point) -> bool {
		!self.is_empty()
			&& (point.x as f64) >= self.x as f64
			&& (point.x as f64) < self.right() as f64
			&& (point.y as f64) >= self.y as f64
			&& (point.y as f64) < self.bottom() as f64
	}

	/// Nearest point inside the rectangle. Edges are inclusive of the last pixel.
	pub fn clamp(&self, point: Point) -> Point {
		let max_x = (self.right() - 1).max(self.x as i64) as f32;
		let max_y = (self.bottom() - 1).max(self.y as i64) as f32;
		Point {
			x: point.x.clamp(self.x as f32, max_x),
			y: point.y.clamp(self.y as f32, max_y),
		}
	}

	/// Smallest rectangle covering every non-empty rectangle in `rects`.
	pub fn bounding(rects: &[Rectangle]) -> Rectangle {
		let mut non_empty = rects.iter().filter(|rect| !rect.is_empty());
		let Some(first) = non_empty.next() else {
			return Rectangle::default();
		};
		let (mut left, mut top) = (first.x as i64, first.y as i64);
		let (mut right, mut bottom) = (first.right(), first.bottom());
		for rect in non_empty {
			left = left.min(rect.x as i64);
			top = top.min(rect.y as i64);
			right = right.max(rect.right());
			bottom = bottom.max(rect.bottom());
		}
		Rectangle {
			x: left as i32,
			y: top as i32,
			width: (right - left) as u32,
			height: (bottom - top) as u32,
		}
	}
}

/// Moves `point` into the closest of `regions` unless it already lies in one.
/// An empty region list leaves the point alone.
pub fn confine(regions: &[Rectangle], point: Point) -> Point {
	if regions.is_empty() || regions.iter().any(|region| region.contains(point)) {
		return point;
	}
	regions
		.iter()
		.filter(|region| !region.is_empty())
		.map(|region| region.clamp(point))
		.min_by(|a, b| {
			let da = (a.x - point.x).powi(2) + (a.y - point.y).powi(2);
			let db = (b.x - point.x).powi(2) + (b.y - point.y).powi(2);
			da.total_cmp(&db)
		})
		.unwrap_or(point)
}
