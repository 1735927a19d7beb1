use crate::{
    ffi::{
        self, DestroyFn, InitFn, PredictPoseFn, RawPredictOption, RawViewportAngle, SetViewportFn,
    },
    PredictError, PredictOptions, PredictResult, Prediction, ViewportAngle, ViewportPredictor,
};
use libloading::Library;
use std::{ffi::c_void, path::Path};

/// Predictor backed by a shared library exporting the [`ffi`] symbols.
///
/// The library stays loaded for as long as this value lives. The plugin handle is released on
/// drop if [`ViewportPredictor::destroy`] was not called explicitly.
pub struct DynamicPredictor {
    name: String,
    init: InitFn,
    set_viewport: SetViewportFn,
    predict_pose: PredictPoseFn,
    destroy: DestroyFn,
    handle: *mut c_void,
    // Must be dropped after every call through the function pointers above.
    _library: Library,
}

// The plugin handle is only touched through `&mut self`.
unsafe impl Send for DynamicPredictor {}

impl DynamicPredictor {
    pub fn open<P: AsRef<Path>>(name: &str, path: P) -> PredictResult<Self> {
        let path = path.as_ref();
        tracing::info!("Loading predictor plugin {name} from {}", path.display());

        let library = unsafe { Library::new(path) }?;
        let init = unsafe { load_symbol::<InitFn>(&library, name, ffi::SYMBOL_INIT, "Init") }?;
        let set_viewport = unsafe {
            load_symbol::<SetViewportFn>(&library, name, ffi::SYMBOL_SET_VIEWPORT, "SetViewport")
        }?;
        let predict_pose = unsafe {
            load_symbol::<PredictPoseFn>(&library, name, ffi::SYMBOL_PREDICT_POSE, "PredictPose")
        }?;
        let destroy =
            unsafe { load_symbol::<DestroyFn>(&library, name, ffi::SYMBOL_DESTROY, "Destroy") }?;

        Ok(Self {
            name: name.to_string(),
            init,
            set_viewport,
            predict_pose,
            destroy,
            handle: std::ptr::null_mut(),
            _library: library,
        })
    }

    fn handle(&self) -> PredictResult<*mut c_void> {
        if self.handle.is_null() {
            Err(PredictError::NotInitialized)
        } else {
            Ok(self.handle)
        }
    }
}

unsafe fn load_symbol<T: Copy>(
    library: &Library,
    name: &str,
    symbol: &[u8],
    label: &'static str,
) -> PredictResult<T> {
    match library.get::<T>(symbol) {
        Ok(symbol) => Ok(*symbol),
        Err(e) => {
            log::warn!("Failed to resolve {label} in predictor {name}: {e}");
            Err(PredictError::MissingSymbol(name.to_string(), label))
        }
    }
}

fn check_status(call: &'static str, status: i32) -> PredictResult<()> {
    if status == ffi::STATUS_OK {
        Ok(())
    } else {
        Err(PredictError::PluginStatus { call, status })
    }
}

impl ViewportPredictor for DynamicPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, options: &PredictOptions) -> PredictResult<()> {
        if !self.handle.is_null() {
            self.destroy()?;
        }

        let raw = RawPredictOption::from(options);
        let handle = unsafe { (self.init)(&raw) };
        if handle.is_null() {
            return Err(PredictError::InitFailed);
        }
        self.handle = handle;
        Ok(())
    }

    fn set_viewport(&mut self, angle: ViewportAngle) -> PredictResult<()> {
        let handle = self.handle()?;
        let raw = RawViewportAngle::from(angle);
        let status = unsafe { (self.set_viewport)(handle, &raw) };
        check_status("SetViewport", status)
    }

    fn predict(&mut self, first_pts: u64) -> PredictResult<Prediction> {
        let handle = self.handle()?;

        let mut buffer = [RawViewportAngle::default(); ffi::MAX_PREDICTED_ANGLES];
        let mut len = 0usize;
        let mut halting_probability = 0f32;
        let status = unsafe {
            (self.predict_pose)(
                handle,
                first_pts,
                buffer.as_mut_ptr(),
                buffer.len(),
                &mut len,
                &mut halting_probability,
            )
        };
        check_status("PredictPose", status)?;

        let mut prediction = Prediction {
            halting_probability,
            ..Default::default()
        };
        for raw in buffer.iter().take(len.min(buffer.len())) {
            let angle = ViewportAngle::from(*raw);
            prediction.angles.insert(angle.pts, angle);
        }
        Ok(prediction)
    }

    fn destroy(&mut self) -> PredictResult<()> {
        if self.handle.is_null() {
            return Ok(());
        }
        let status = unsafe { (self.destroy)(self.handle) };
        self.handle = std::ptr::null_mut();
        check_status("Destroy", status)
    }
}

impl Drop for DynamicPredictor {
    fn drop(&mut self) {
        if let Err(e) = ViewportPredictor::destroy(self) {
            tracing::warn!("Failed to destroy predictor {}: {e}", self.name);
        }
    }
}
