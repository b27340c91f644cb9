use crate::config::ClassifierOptions;
use crate::enums::Orientation;
use crate::error::ReconError;
use crate::job::{Stage, Warning};
use crate::slice::Slice;

use nalgebra::Vector3;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Slices sharing one reference frame and one plane normal.
#[derive(Clone, Debug)]
pub struct Stack {
    frame_of_reference: Option<String>,
    normal: Option<Vector3<f64>>,
    slices: Vec<Slice>,
}

impl Stack {
    pub fn new(
        frame_of_reference: Option<String>,
        normal: Option<Vector3<f64>>,
        slices: Vec<Slice>,
    ) -> Self {
        Self {
            frame_of_reference,
            normal,
            slices,
        }
    }

    pub fn frame_of_reference(&self) -> Option<&str> {
        self.frame_of_reference.as_deref()
    }

    /// Unit normal shared by the member slices; `None` for a stack of
    /// slices without orientation.
    pub fn normal(&self) -> Option<&Vector3<f64>> {
        self.normal.as_ref()
    }

    pub fn orientation(&self) -> Option<Orientation> {
        self.normal.as_ref().map(Orientation::from_normal)
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn into_slices(self) -> Vec<Slice> {
        self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

struct Group {
    normal: Vector3<f64>,
    slices: Vec<Slice>,
}

/// Groups raw slices into stacks by reference frame and plane normal.
pub struct StackClassifier {
    options: ClassifierOptions,
}

impl StackClassifier {
    pub fn new(options: ClassifierOptions) -> Self {
        Self { options }
    }

    /// # Errors
    ///
    /// `NoUsableGeometry` when no slice ends up in any stack.
    pub fn classify(
        &self,
        slices: Vec<Slice>,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<Stack>, ReconError> {
        let input_count = slices.len();
        let mut frames: BTreeMap<Option<String>, Vec<Slice>> = BTreeMap::new();
        for slice in slices {
            let frame = slice.frame_of_reference_uid().map(str::to_string);
            frames.entry(frame).or_default().push(slice);
        }

        let mut stacks = Vec::new();
        for (frame, members) in frames {
            stacks.extend(self.classify_frame(frame, members, warnings));
        }

        if stacks.is_empty() {
            return Err(ReconError::NoUsableGeometry);
        }

        info!(
            slices = input_count,
            stacks = stacks.len(),
            "Classified slices into stacks"
        );
        for stack in &stacks {
            debug!(
                frame = stack.frame_of_reference(),
                orientation = ?stack.orientation(),
                slices = stack.len(),
                "Stack"
            );
        }
        Ok(stacks)
    }

    fn classify_frame(
        &self,
        frame: Option<String>,
        slices: Vec<Slice>,
        warnings: &mut Vec<Warning>,
    ) -> Vec<Stack> {
        let threshold = 1.0 - self.options.cosine_tolerance;
        let mut groups: Vec<Group> = Vec::new();
        let mut unoriented = Vec::new();

        for slice in slices {
            match slice.normal() {
                Err(e) => {
                    Warning::record(
                        warnings,
                        Stage::Classify,
                        format!("Dropped slice {}: {e}", slice.label()),
                    );
                }
                Ok(None) => unoriented.push(slice),
                Ok(Some(normal)) => {
                    match groups
                        .iter_mut()
                        .find(|group| group.normal.dot(&normal).abs() > threshold)
                    {
                        Some(group) => group.slices.push(slice),
                        None => groups.push(Group {
                            normal,
                            slices: vec![slice],
                        }),
                    }
                }
            }
        }

        if !unoriented.is_empty() {
            let frame_name = frame.as_deref().unwrap_or("<none>");
            if let [group] = groups.as_mut_slice() {
                Warning::record(
                    warnings,
                    Stage::Classify,
                    format!(
                        "{} slices without orientation joined the only stack of frame {frame_name}",
                        unoriented.len()
                    ),
                );
                group.slices.append(&mut unoriented);
            } else {
                Warning::record(
                    warnings,
                    Stage::Classify,
                    format!(
                        "{} slices without orientation in frame {frame_name} form their own stack",
                        unoriented.len()
                    ),
                );
            }
        }

        let mut stacks: Vec<Stack> = groups
            .into_iter()
            .map(|group| Stack::new(frame.clone(), Some(group.normal), group.slices))
            .collect();
        if !unoriented.is_empty() {
            stacks.push(Stack::new(frame, None, unoriented));
        }
        stacks
    }
}
