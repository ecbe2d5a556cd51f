use log::debug;

use crate::detect::result::Detection;

/// Intersection-over-Union of two corner-form detections.
///
/// Boxes are compared in center form. Degenerate unions yield 0.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();

    let xx1 = (ax - a.w / 2.0).max(bx - b.w / 2.0);
    let yy1 = (ay - a.h / 2.0).max(by - b.h / 2.0);
    let xx2 = (ax + a.w / 2.0).min(bx + b.w / 2.0);
    let yy2 = (ay + a.h / 2.0).min(by + b.h / 2.0);

    let intersection = (xx2 - xx1).max(0.0) * (yy2 - yy1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }
    intersection / union
}

/// Non-maximum suppression.
///
/// Every still-kept detection is compared with every later still-kept one.
/// When the overlap exceeds `threshold` the lower-confidence box is dropped;
/// on a tie the earlier box loses. Survivors keep their input order.
pub fn suppress(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    if detections.len() < 2 {
        return detections;
    }

    let mut keep = vec![true; detections.len()];
    for i in 0..detections.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !keep[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > threshold {
                if detections[i].confidence > detections[j].confidence {
                    keep[j] = false;
                } else {
                    keep[i] = false;
                    break;
                }
            }
        }
    }

    let before = detections.len();
    let kept: Vec<Detection> = detections
        .into_iter()
        .zip(keep)
        .filter_map(|(det, kept)| kept.then_some(det))
        .collect();
    debug!("nms kept {} of {} detections", kept.len(), before);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, c: f32, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::new(label, c, x, y, w, h)
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = det("a", 0.5, 10.0, 10.0, 20.0, 20.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = det("a", 0.5, 0.0, 0.0, 10.0, 10.0);
        let b = det("b", 0.5, 50.0, 50.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_zero_area_boxes_is_zero() {
        let a = det("a", 0.5, 5.0, 5.0, 0.0, 0.0);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn overlapping_pair_keeps_higher_confidence() {
        let low = det("person", 0.4, 0.0, 0.0, 100.0, 100.0);
        let high = det("person", 0.9, 5.0, 5.0, 100.0, 100.0);
        let out = suppress(vec![low, high.clone()], 0.5);
        assert_eq!(out, vec![high]);
    }

    #[test]
    fn first_box_wins_when_it_is_stronger() {
        let high = det("person", 0.9, 0.0, 0.0, 100.0, 100.0);
        let low = det("person", 0.4, 5.0, 5.0, 100.0, 100.0);
        let out = suppress(vec![high.clone(), low], 0.5);
        assert_eq!(out, vec![high]);
    }

    #[test]
    fn tie_drops_the_earlier_box_and_stops_comparing_it() {
        // a overlaps b and c (IoU 1/3 each); b and c do not touch.
        let a = det("person", 0.8, 10.0, 0.0, 20.0, 10.0);
        let b = det("person", 0.8, 0.0, 0.0, 20.0, 10.0);
        let c = det("person", 0.5, 20.0, 0.0, 20.0, 10.0);
        assert!(iou(&a, &b) > 0.3 && iou(&a, &c) > 0.3);
        assert_eq!(iou(&b, &c), 0.0);

        let out = suppress(vec![a, b.clone(), c.clone()], 0.3);
        assert_eq!(out, vec![b, c]);
    }

    #[test]
    fn low_overlap_keeps_both() {
        let a = det("person", 0.9, 0.0, 0.0, 100.0, 100.0);
        let b = det("person", 0.4, 90.0, 90.0, 100.0, 100.0);
        let out = suppress(vec![a.clone(), b.clone()], 0.5);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn empty_and_single_inputs_pass_through() {
        assert!(suppress(Vec::new(), 0.5).is_empty());
        let only = det("car", 0.1, 1.0, 2.0, 3.0, 4.0);
        assert_eq!(suppress(vec![only.clone()], 0.0), vec![only]);
    }

    #[test]
    fn survivors_keep_input_order() {
        let a = det("a", 0.3, 0.0, 0.0, 10.0, 10.0);
        let b = det("b", 0.8, 500.0, 500.0, 10.0, 10.0);
        let c = det("c", 0.9, 1.0, 1.0, 10.0, 10.0);
        let d = det("d", 0.2, 900.0, 900.0, 10.0, 10.0);
        let out = suppress(vec![a, b.clone(), c.clone(), d.clone()], 0.3);
        assert_eq!(out, vec![b, c, d]);
    }
}
